//! Rendezvous REST client.
//!
//! Thin JSON wrapper over the rendezvous HTTP API. 200 with a JSON body is
//! the success path, 204 is success with no body, 404 surfaces as
//! [`ApiError::NotFound`] (the caller uses it to decide whether to register
//! a new device), anything else becomes a status-carrying error.

use serde::{Deserialize, Serialize};

use piko_core::{Device, Network};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("http status code {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bad endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

/// Punch peer details, used for NAT endpoint discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchDetails {
    /// The punch peer's overlay IPv6 address.
    pub ip: String,

    /// The punch peer's base64 WireGuard public key.
    #[serde(rename = "key")]
    pub public_key: String,

    /// The punch peer's clearnet endpoint.
    pub endpoint: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    method: &'a str,
}

#[derive(Serialize)]
struct NewDeviceRequest<'a> {
    name: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
struct NewNetworkRequest<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct MembershipRequest {
    #[serde(rename = "Device")]
    device: i64,
    #[serde(rename = "Network")]
    network: i64,
}

/// Client for the rendezvous REST API.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl Client {
    /// `base` is the API root, e.g. `http://localhost:8080/api`.
    pub fn new(base: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Log in with username-password auth. The response body is the token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let res = self
            .http
            .post(self.endpoint("/auth"))
            .json(&LoginRequest {
                username,
                password,
                method: "username-password",
            })
            .send()
            .await?;

        let res = check(res)?;
        Ok(res.text().await?)
    }

    /// All devices attached to our user.
    pub async fn devices(&self) -> Result<Vec<Device>, ApiError> {
        self.get_json("/list/devices").await
    }

    /// All networks attached to our user.
    pub async fn networks(&self) -> Result<Vec<Network>, ApiError> {
        self.get_json("/list/networks").await
    }

    pub async fn device(&self, id: i64) -> Result<Device, ApiError> {
        self.get_json(&format!("/device/info?id={id}")).await
    }

    pub async fn network(&self, id: i64) -> Result<Network, ApiError> {
        self.get_json(&format!("/network/info?id={id}")).await
    }

    /// Register a new device under our user.
    pub async fn new_device(&self, name: &str, key: &str) -> Result<Device, ApiError> {
        self.post_json("/new/device", &NewDeviceRequest { name, key })
            .await
    }

    pub async fn new_network(&self, name: &str) -> Result<Network, ApiError> {
        self.post_json("/new/network", &NewNetworkRequest { name })
            .await
    }

    pub async fn join_network(&self, device: i64, network: i64) -> Result<(), ApiError> {
        self.post_no_body("/device/join", &MembershipRequest { device, network })
            .await
    }

    pub async fn leave_network(&self, device: i64, network: i64) -> Result<(), ApiError> {
        self.post_no_body("/device/leave", &MembershipRequest { device, network })
            .await
    }

    /// Details of the punch peer used for endpoint discovery.
    pub async fn punch_details(&self) -> Result<PunchDetails, ApiError> {
        self.get_json("/punch").await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ApiError> {
        let res = self
            .http
            .get(self.endpoint(path))
            .header("Accept", "application/json")
            .bearer_auth(&self.token)
            .send()
            .await?;

        Ok(check(res)?.json().await?)
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let res = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        Ok(check(res)?.json().await?)
    }

    async fn post_no_body<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let res = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        check(res)?;
        Ok(())
    }
}

fn check(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    match res.status().as_u16() {
        200 | 204 => Ok(res),
        404 => Err(ApiError::NotFound),
        status => Err(ApiError::Status(status)),
    }
}
