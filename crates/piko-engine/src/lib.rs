//! piko-engine — the membership reconciler.
//!
//! The engine owns the canonical view of the local device, the networks it
//! belongs to, and the derived peer set. Gateway events mutate that state
//! under a single lock; observer callbacks run inside the same lock, in
//! registration order, after the peer set has been recomputed — so every
//! observer of one event sees the same snapshot, and re-entrant mutation is
//! impossible by construction.
//!
//! Rendezvous lookups (the full resync on connect, fetching a network we
//! just joined) happen *before* the lock is taken; the lock is never held
//! across network I/O.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use piko_core::{Device, Network};

/// Where the engine fetches authoritative membership from.
///
/// The daemon backs this with the rendezvous client; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Every network visible to our user, with device lists.
    async fn list_networks(&self) -> anyhow::Result<Vec<Network>>;

    /// One network by id, with its device list.
    async fn fetch_network(&self, id: i64) -> anyhow::Result<Network>;
}

/// A consistent snapshot of engine state, taken under the lock and handed
/// to observers.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    /// The local device.
    pub device: Device,
    /// Networks the local device is a member of.
    pub networks: Vec<Network>,
    /// Every device sharing at least one network with us, deduplicated,
    /// excluding ourselves.
    pub peers: Vec<Device>,
}

/// Observer of join/leave events. Runs under the engine lock.
pub type MembershipObserver =
    Box<dyn Fn(EngineSnapshot, Network, Device) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer of device updates. Runs under the engine lock.
pub type UpdateObserver =
    Box<dyn Fn(EngineSnapshot, Device) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer of full rebuilds. Runs under the engine lock.
pub type RebuildObserver = Box<dyn Fn(EngineSnapshot) -> BoxFuture<'static, ()> + Send + Sync>;

struct State {
    device: Device,
    networks: Vec<Network>,
    peers: Vec<Device>,

    on_join: Vec<MembershipObserver>,
    on_leave: Vec<MembershipObserver>,
    on_update: Vec<UpdateObserver>,
    on_rebuild: Vec<RebuildObserver>,
}

impl State {
    /// Recompute the peer set from the network view.
    ///
    /// Iterates networks and devices in order; the first occurrence of an
    /// id wins, and the local device never appears.
    fn recompute_peers(&mut self, self_id: i64) {
        let mut peers: Vec<Device> = Vec::new();
        for nw in &self.networks {
            for dev in &nw.devices {
                if dev.id == self_id {
                    continue;
                }
                if !peers.iter().any(|p| p.id == dev.id) {
                    peers.push(dev.clone());
                }
            }
        }
        self.peers = peers;
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            device: self.device.clone(),
            networks: self.networks.clone(),
            peers: self.peers.clone(),
        }
    }
}

/// The membership reconciler.
pub struct Engine {
    self_id: i64,
    source: Arc<dyn MembershipSource>,
    state: Mutex<State>,
}

impl Engine {
    /// `device` is the local device as the rendezvous reported it; its id
    /// is fixed for the lifetime of the engine.
    pub fn new(device: Device, source: Arc<dyn MembershipSource>) -> Self {
        Self {
            self_id: device.id,
            source,
            state: Mutex::new(State {
                device,
                networks: Vec::new(),
                peers: Vec::new(),
                on_join: Vec::new(),
                on_leave: Vec::new(),
                on_update: Vec::new(),
                on_rebuild: Vec::new(),
            }),
        }
    }

    pub fn self_id(&self) -> i64 {
        self.self_id
    }

    /// Full resync against the membership source. Applied on every gateway
    /// `Connect`, so a reconnect always converges regardless of what events
    /// were missed.
    pub async fn resync(&self) {
        let networks = match self.source.list_networks().await {
            Ok(networks) => networks,
            Err(e) => {
                tracing::warn!(error = %e, "resync failed to fetch networks");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.networks = networks
            .into_iter()
            .filter(|nw| nw.contains(self.self_id))
            .collect();
        state.recompute_peers(self.self_id);

        tracing::info!(
            networks = state.networks.len(),
            peers = state.peers.len(),
            "membership state rebuilt"
        );

        for obs in &state.on_rebuild {
            obs(state.snapshot()).await;
        }
    }

    /// A device (possibly ours) joined a network.
    pub async fn handle_join(&self, nw: Network, dev: Device) {
        if dev.id == self.self_id {
            // Joining ourselves: the event's network copy has no device
            // list worth trusting, fetch the full one.
            let full = match self.source.fetch_network(nw.id).await {
                Ok(full) => full,
                Err(e) => {
                    tracing::warn!(network = nw.id, error = %e, "failed to fetch joined network");
                    return;
                }
            };

            let mut state = self.state.lock().await;
            match state.networks.iter().position(|n| n.id == full.id) {
                Some(i) => state.networks[i] = full,
                None => state.networks.push(full),
            }
            state.recompute_peers(self.self_id);

            tracing::info!(network = nw.id, "joined network");
            for obs in &state.on_join {
                obs(state.snapshot(), nw.clone(), dev.clone()).await;
            }
            return;
        }

        let mut state = self.state.lock().await;
        let Some(existing) = state.networks.iter_mut().find(|n| n.id == nw.id) else {
            // The rendezvous pushed an event for a network we are not in;
            // the next resync will sort it out.
            tracing::warn!(network = nw.id, device = dev.id, "join event for unknown network");
            return;
        };

        existing.push_device(dev.clone());
        state.recompute_peers(self.self_id);

        tracing::info!(network = nw.id, device = dev.id, "peer joined network");
        for obs in &state.on_join {
            obs(state.snapshot(), nw.clone(), dev.clone()).await;
        }
    }

    /// A device (possibly ours) left a network.
    pub async fn handle_leave(&self, nw: Network, dev: Device) {
        let mut state = self.state.lock().await;

        if dev.id == self.self_id {
            state.networks.retain(|n| n.id != nw.id);
            tracing::info!(network = nw.id, "left network");
        } else {
            let Some(existing) = state.networks.iter_mut().find(|n| n.id == nw.id) else {
                tracing::warn!(
                    network = nw.id,
                    device = dev.id,
                    "leave event for unknown network"
                );
                return;
            };
            existing.remove_device(dev.id);
            tracing::info!(network = nw.id, device = dev.id, "peer left network");
        }

        state.recompute_peers(self.self_id);
        for obs in &state.on_leave {
            obs(state.snapshot(), nw.clone(), dev.clone()).await;
        }
    }

    /// A device changed its attributes (typically its endpoint).
    pub async fn handle_update(&self, dev: Device) {
        let mut state = self.state.lock().await;

        if dev.id == self.self_id {
            state.device = dev.clone();
        }

        for nw in &mut state.networks {
            if let Some(existing) = nw.devices.iter_mut().find(|d| d.id == dev.id) {
                *existing = dev.clone();
            }
        }

        state.recompute_peers(self.self_id);

        tracing::debug!(device = dev.id, "device updated");
        for obs in &state.on_update {
            obs(state.snapshot(), dev.clone()).await;
        }
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    pub async fn self_device(&self) -> Device {
        self.state.lock().await.device.clone()
    }

    pub async fn networks(&self) -> Vec<Network> {
        self.state.lock().await.networks.clone()
    }

    pub async fn peers(&self) -> Vec<Device> {
        self.state.lock().await.peers.clone()
    }

    /// Look up a current peer by its base64 public key.
    pub async fn peer_by_key(&self, key: &str) -> Option<Device> {
        self.state
            .lock()
            .await
            .peers
            .iter()
            .find(|p| p.public_key == key)
            .cloned()
    }

    // ── Observer registration ────────────────────────────────────────────

    pub async fn on_join(&self, obs: MembershipObserver) {
        self.state.lock().await.on_join.push(obs);
    }

    pub async fn on_leave(&self, obs: MembershipObserver) {
        self.state.lock().await.on_leave.push(obs);
    }

    pub async fn on_update(&self, obs: UpdateObserver) {
        self.state.lock().await.on_update.push(obs);
    }

    pub async fn on_rebuild(&self, obs: RebuildObserver) {
        self.state.lock().await.on_rebuild.push(obs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory stand-in for the rendezvous.
    struct FakeSource {
        networks: StdMutex<Vec<Network>>,
    }

    impl FakeSource {
        fn new(networks: Vec<Network>) -> Arc<Self> {
            Arc::new(Self {
                networks: StdMutex::new(networks),
            })
        }

        fn set(&self, networks: Vec<Network>) {
            *self.networks.lock().unwrap() = networks;
        }
    }

    #[async_trait]
    impl MembershipSource for FakeSource {
        async fn list_networks(&self) -> anyhow::Result<Vec<Network>> {
            Ok(self.networks.lock().unwrap().clone())
        }

        async fn fetch_network(&self, id: i64) -> anyhow::Result<Network> {
            self.networks
                .lock()
                .unwrap()
                .iter()
                .find(|n| n.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such network"))
        }
    }

    fn device(id: i64) -> Device {
        Device {
            id,
            name: format!("dev{id}"),
            public_key: format!("key{id}"),
            ip: format!("fd00::{id:x}"),
            ..Device::default()
        }
    }

    fn network(id: i64, device_ids: &[i64]) -> Network {
        Network {
            id,
            name: format!("nw{id}"),
            devices: device_ids.iter().map(|&d| device(d)).collect(),
            ..Network::default()
        }
    }

    fn peer_ids(peers: &[Device]) -> Vec<i64> {
        peers.iter().map(|p| p.id).collect()
    }

    /// The invariant every reachable state must satisfy.
    async fn assert_peer_invariant(engine: &Engine) {
        let networks = engine.networks().await;
        let peers = engine.peers().await;

        let mut expected: Vec<i64> = Vec::new();
        for nw in &networks {
            for dev in &nw.devices {
                if dev.id != engine.self_id() && !expected.contains(&dev.id) {
                    expected.push(dev.id);
                }
            }
        }

        assert_eq!(peer_ids(&peers), expected);
        assert!(!peers.iter().any(|p| p.id == engine.self_id()));
    }

    #[tokio::test]
    async fn join_leave_churn() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source.clone());

        let events = Arc::new(StdMutex::new(Vec::<String>::new()));
        let log = events.clone();
        engine
            .on_join(Box::new(move |_snap, nw, dev| {
                let log = log.clone();
                let entry = format!("join {} {}", nw.id, dev.id);
                Box::pin(async move { log.lock().unwrap().push(entry) })
            }))
            .await;
        let log = events.clone();
        engine
            .on_leave(Box::new(move |_snap, nw, dev| {
                let log = log.clone();
                let entry = format!("leave {} {}", nw.id, dev.id);
                Box::pin(async move { log.lock().unwrap().push(entry) })
            }))
            .await;

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;
        engine.handle_join(network(3, &[]), device(11)).await;
        engine.handle_leave(network(3, &[]), device(9)).await;

        assert_eq!(peer_ids(&engine.peers().await), vec![11]);
        assert_peer_invariant(&engine).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["join 3 7", "join 3 9", "join 3 11", "leave 3 9"]
        );
    }

    #[tokio::test]
    async fn resync_after_disconnect_converges() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source.clone());

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;
        engine.handle_join(network(3, &[]), device(11)).await;
        assert_eq!(peer_ids(&engine.peers().await), vec![9, 11]);

        // Device 9 vanished while we were disconnected.
        source.set(vec![network(3, &[7, 11])]);
        engine.resync().await;

        assert_eq!(peer_ids(&engine.peers().await), vec![11]);
        assert_peer_invariant(&engine).await;
    }

    #[tokio::test]
    async fn resync_matches_rebuild_alone() {
        let server_state = vec![network(3, &[7, 11]), network(4, &[2, 5]), network(5, &[7, 9, 11])];

        // Engine A: churn first, then rebuild.
        let source_a = FakeSource::new(server_state.clone());
        let engine_a = Engine::new(device(7), source_a);
        engine_a.handle_join(network(3, &[]), device(7)).await;
        engine_a.handle_join(network(3, &[]), device(9)).await;
        engine_a.handle_leave(network(3, &[]), device(9)).await;
        engine_a.resync().await;

        // Engine B: rebuild only.
        let source_b = FakeSource::new(server_state);
        let engine_b = Engine::new(device(7), source_b);
        engine_b.resync().await;

        assert_eq!(
            peer_ids(&engine_a.peers().await),
            peer_ids(&engine_b.peers().await)
        );
        assert_peer_invariant(&engine_a).await;

        // Network 4 does not contain us and must not contribute peers.
        assert_eq!(peer_ids(&engine_a.peers().await), vec![11, 9]);
    }

    #[tokio::test]
    async fn join_for_unknown_network_is_ignored() {
        let source = FakeSource::new(vec![]);
        let engine = Engine::new(device(7), source);

        let fired = Arc::new(StdMutex::new(0usize));
        let count = fired.clone();
        engine
            .on_join(Box::new(move |_snap, _nw, _dev| {
                let count = count.clone();
                Box::pin(async move { *count.lock().unwrap() += 1 })
            }))
            .await;

        engine.handle_join(network(99, &[]), device(9)).await;

        assert!(engine.peers().await.is_empty());
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_join_is_deduplicated() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source);

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;
        engine.handle_join(network(3, &[]), device(9)).await;

        assert_eq!(peer_ids(&engine.peers().await), vec![9]);
        assert_peer_invariant(&engine).await;
    }

    #[tokio::test]
    async fn update_replaces_peer_attributes() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source);

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;

        let mut updated = device(9);
        updated.endpoint = Some("203.0.113.9:34567".to_string());
        engine.handle_update(updated).await;

        let peers = engine.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.9:34567"));
    }

    #[tokio::test]
    async fn update_of_self_replaces_self() {
        let source = FakeSource::new(vec![]);
        let engine = Engine::new(device(7), source);

        let mut updated = device(7);
        updated.endpoint = Some("198.51.100.1:1000".to_string());
        engine.handle_update(updated).await;

        let me = engine.self_device().await;
        assert_eq!(me.endpoint.as_deref(), Some("198.51.100.1:1000"));
        assert!(engine.peers().await.is_empty());
    }

    #[tokio::test]
    async fn peer_lookup_by_key() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source);

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;

        assert_eq!(engine.peer_by_key("key9").await.map(|d| d.id), Some(9));
        assert_eq!(engine.peer_by_key("key7").await, None);
        assert_eq!(engine.peer_by_key("missing").await, None);
    }

    #[tokio::test]
    async fn observers_see_recomputed_peers() {
        let source = FakeSource::new(vec![network(3, &[7])]);
        let engine = Engine::new(device(7), source);

        let seen = Arc::new(StdMutex::new(Vec::<Vec<i64>>::new()));
        let log = seen.clone();
        engine
            .on_join(Box::new(move |snap, _nw, _dev| {
                let log = log.clone();
                let ids: Vec<i64> = snap.peers.iter().map(|p| p.id).collect();
                Box::pin(async move { log.lock().unwrap().push(ids) })
            }))
            .await;

        engine.handle_join(network(3, &[]), device(7)).await;
        engine.handle_join(network(3, &[]), device(9)).await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![], vec![9]]);
    }
}
