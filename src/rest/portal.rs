//! Client for the developer portal that issues API keys.
//!
//! Keys are bound to the public IP they were created for. The portal is
//! session based: `/login` sets a cookie which authorizes the key listing,
//! creation and revocation calls that follow.

use std::net::IpAddr;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use log::{debug, info, warn};
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::rest::error::ProvisionError;

/// Default developer portal endpoint.
pub const DEFAULT_PORTAL_URL: &str = "https://developer.clashofclans.com/api";
/// Default service answering the caller's public IP as plain text.
pub const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// An API key as listed by the developer portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// IP ranges the key is allowed from, e.g. `1.2.3.4/32`
    #[serde(default)]
    pub cidr_ranges: Vec<String>,
    /// The bearer token itself
    pub key: String,
}

impl ApiKey {
    /// Returns `true` when one of the key ranges contains `ip`.
    pub fn allows_ip(&self, ip: &str) -> bool {
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.cidr_ranges.iter().any(|range| range_contains(range, ip))
    }
}

/// Checks `ip` against a CIDR range; a bare address is a single host.
fn range_contains(range: &str, ip: IpAddr) -> bool {
    let (address, prefix) = range.split_once('/').unwrap_or((range, ""));
    let Ok(network) = address.trim().parse::<IpAddr>() else {
        return false;
    };

    let width = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix.trim() {
        "" => width,
        prefix => match prefix.parse::<u32>() {
            Ok(prefix) if prefix <= width => prefix,
            _ => return false,
        },
    };

    match (network, ip) {
        (IpAddr::V4(network), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(network) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(network) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// A logged in portal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSession {
    /// Short lived token returned by `/login`; its claims embed the caller IP.
    pub temporary_token: String,
}

/// Operations of the developer portal used to provision keys.
///
/// This trait abstracts the HTTP operations for easier testing with mocks.
#[automock]
#[async_trait]
pub trait DeveloperPortal: Send + Sync {
    /// Opens a session with the account credentials.
    async fn login(&self, email: &str, password: &str) -> Result<PortalSession, ProvisionError>;
    /// Resolves the public IP address the keys must be bound to.
    async fn external_ip(&self, session: &PortalSession) -> Result<String, ProvisionError>;
    /// Lists every key of the account.
    async fn list_keys(&self) -> Result<Vec<ApiKey>, ProvisionError>;
    /// Creates a key allowed from `ip`.
    async fn create_key(
        &self,
        name: &str,
        description: &str,
        ip: &str,
    ) -> Result<ApiKey, ProvisionError>;
    /// Revokes the key with the given portal id.
    async fn revoke_key(&self, id: &str) -> Result<(), ProvisionError>;
}

/// HTTP implementation of [`DeveloperPortal`].
pub struct PortalClient {
    /// Developer portal base url, without trailing slash
    url: String,
    /// Fallback service used when the token claims carry no IP
    ip_echo_url: String,
    /// HTTP client holding the session cookie
    client: Client,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "temporaryAPIToken")]
    temporary_api_token: String,
}

#[derive(Deserialize)]
struct KeyListResponse {
    #[serde(default)]
    keys: Vec<ApiKey>,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: ApiKey,
}

impl PortalClient {
    /// Create a new [PortalClient].
    ///
    /// # Arguments
    ///
    /// * `url` - Developer portal base url.
    /// * `ip_echo_url` - Service returning the caller public IP as text.
    pub fn new(url: &str, ip_echo_url: &str) -> Result<Self, ProvisionError> {
        let client = Client::builder().cookie_store(true).build()?;
        Ok(PortalClient {
            url: url.trim_end_matches('/').to_owned(),
            ip_echo_url: ip_echo_url.to_owned(),
            client,
        })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ProvisionError> {
        let url = format!("{}{}", self.url, path);
        debug!("request POST {}", url);

        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Portal {
                path: path.to_owned(),
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DeveloperPortal for PortalClient {
    async fn login(&self, email: &str, password: &str) -> Result<PortalSession, ProvisionError> {
        let url = format!("{}/login", self.url);
        info!("logging into the developer portal as {}", email);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Login {
                status: status.as_u16(),
                message,
            });
        }

        let login: LoginResponse = response.json().await?;
        Ok(PortalSession {
            temporary_token: login.temporary_api_token,
        })
    }

    async fn external_ip(&self, session: &PortalSession) -> Result<String, ProvisionError> {
        if let Some(ip) = ip_from_token(&session.temporary_token) {
            debug!("resolved external ip {} from token claims", ip);
            return Ok(ip);
        }

        warn!("no ip in token claims, asking {}", self.ip_echo_url);
        let ip = self
            .client
            .get(&self.ip_echo_url)
            .send()
            .await?
            .text()
            .await?;

        let ip = ip.trim();
        if ip.is_empty() {
            return Err(ProvisionError::UnknownIp);
        }
        Ok(ip.to_owned())
    }

    async fn list_keys(&self) -> Result<Vec<ApiKey>, ProvisionError> {
        let response: KeyListResponse = self.post("/apikey/list", &json!({})).await?;
        Ok(response.keys)
    }

    async fn create_key(
        &self,
        name: &str,
        description: &str,
        ip: &str,
    ) -> Result<ApiKey, ProvisionError> {
        let body = json!({
            "name": name,
            "description": description,
            "cidrRanges": [ip],
            "scopes": null,
        });
        let response: KeyResponse = self.post("/apikey/create", &body).await?;
        Ok(response.key)
    }

    async fn revoke_key(&self, id: &str) -> Result<(), ProvisionError> {
        let _: Value = self.post("/apikey/revoke", &json!({ "id": id })).await?;
        Ok(())
    }
}

/// Extracts the caller IP from the `limits[].cidrs` claims of a portal token.
///
/// The token is a JWT; only its payload segment is decoded, the signature is
/// not checked.
pub fn ip_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;

    claims
        .get("limits")?
        .as_array()?
        .iter()
        .filter_map(|limit| limit.get("cidrs")?.as_array())
        .flatten()
        .filter_map(Value::as_str)
        .find_map(|cidr| cidr.split('/').next().map(str::to_owned))
}
