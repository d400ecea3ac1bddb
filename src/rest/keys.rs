//! Rotating pool of API keys.
//!
//! This module provides the [`KeyManager`] that hands out keys round-robin,
//! drops keys the API rejects and provisions fresh ones through the
//! [`DeveloperPortal`] when account credentials are configured.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::rest::{
    error::ProvisionError,
    portal::{DEFAULT_IP_ECHO_URL, DEFAULT_PORTAL_URL, DeveloperPortal},
};

/// Hard cap of keys per developer account.
pub const MAX_KEYS_PER_ACCOUNT: usize = 10;

/// Cheapest authenticated call, used to check that a key is still accepted.
pub const PROBE_PATH: &str = "/locations?limit=1";

/// Deadline of a revalidation probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Developer account used to provision keys.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub email: String,
    pub password: String,
    /// Name given to the keys this process owns
    #[serde(default = "default_key_name")]
    pub key_name: String,
    /// How many keys to keep, between 1 and 10
    #[serde(default = "default_key_count")]
    pub key_count: usize,
    #[serde(default = "default_key_description")]
    pub key_description: String,
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
    #[serde(default = "default_ip_echo_url")]
    pub ip_echo_url: String,
}

fn default_key_name() -> String {
    "clanwatch".to_owned()
}

fn default_key_count() -> usize {
    1
}

fn default_key_description() -> String {
    "created by clanwatch".to_owned()
}

fn default_portal_url() -> String {
    DEFAULT_PORTAL_URL.to_owned()
}

fn default_ip_echo_url() -> String {
    DEFAULT_IP_ECHO_URL.to_owned()
}

/// Position of the next key to hand out.
///
/// Only moved through [`RotationCursor::advance`], which reads the current
/// position and moves past it in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationCursor {
    index: usize,
}

impl RotationCursor {
    /// Returns the index to use for a ring of `len` keys and moves past it,
    /// wrapping to the start. `None` for an empty ring.
    pub fn advance(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        if self.index >= len {
            self.index = 0;
        }

        let current = self.index;
        self.index = (current + 1) % len;
        Some(current)
    }
}

type Provisioner = (Account, Arc<dyn DeveloperPortal>);

#[derive(Debug, Default)]
struct KeyRing {
    keys: Vec<String>,
    cursor: RotationCursor,
}

/// Owns the API keys and their rotation.
///
/// # Thread Safety
///
/// The key list and the cursor live behind one lock which is never held across
/// an `.await`, so [`KeyManager::current`] is atomic with respect to concurrent
/// requests.
pub struct KeyManager {
    /// Keys and rotation cursor
    ring: Mutex<KeyRing>,
    /// REST API base url, used for the revalidation probes
    base_url: String,
    /// HTTP client for the revalidation probes
    client: Client,
    probe_timeout: Duration,
    /// Account and portal, present when keys can be provisioned
    provisioner: Mutex<Option<Provisioner>>,
    /// Serializes refreshes triggered by concurrent requests
    refresh_lock: tokio::sync::Mutex<()>,
}

impl KeyManager {
    /// Create a new [KeyManager].
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base url of the REST API the keys authorize.
    /// * `keys` - Initial keys, possibly empty when an account is attached later.
    pub fn new(base_url: &str, keys: Vec<String>) -> Self {
        let manager = KeyManager {
            ring: Mutex::new(KeyRing::default()),
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: Client::new(),
            probe_timeout: PROBE_TIMEOUT,
            provisioner: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        };
        manager.add_keys(keys);
        manager
    }

    /// Attaches account credentials so keys can be provisioned.
    pub fn with_account(self, account: Account, portal: Arc<dyn DeveloperPortal>) -> Self {
        self.set_account(account, portal);
        self
    }

    /// Sets the deadline of each revalidation probe.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Attaches account credentials, replacing previous ones.
    pub fn set_account(&self, account: Account, portal: Arc<dyn DeveloperPortal>) {
        *self.provisioner.lock().unwrap_or_else(PoisonError::into_inner) = Some((account, portal));
    }

    pub fn can_provision(&self) -> bool {
        self.provisioner().is_some()
    }

    fn provisioner(&self) -> Option<Provisioner> {
        self.provisioner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ring(&self) -> MutexGuard<'_, KeyRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the key at the cursor and advances the cursor.
    pub fn current(&self) -> Option<String> {
        let mut ring = self.ring();
        let len = ring.keys.len();
        let index = ring.cursor.advance(len)?;
        ring.keys.get(index).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.ring().keys.clone()
    }

    pub fn len(&self) -> usize {
        self.ring().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().keys.is_empty()
    }

    /// Appends keys that are not held yet, keeping their order.
    pub fn add_keys(&self, keys: Vec<String>) {
        let mut ring = self.ring();
        for key in keys {
            if !key.is_empty() && !ring.keys.contains(&key) {
                ring.keys.push(key);
            }
        }
    }

    /// Removes `key`, returning whether it was held.
    pub fn remove_key(&self, key: &str) -> bool {
        let mut ring = self.ring();
        let before = ring.keys.len();
        ring.keys.retain(|k| k != key);
        before != ring.keys.len()
    }

    /// Probes every held key and removes the ones answered with `403`.
    ///
    /// Returns the removed keys. Keys whose probe fails at the transport level
    /// are kept: the failure says nothing about the key.
    pub async fn revalidate(&self) -> Vec<String> {
        let keys = self.keys();
        let url = format!("{}{}", self.base_url, PROBE_PATH);

        let statuses = join_all(keys.iter().map(|key| {
            self.client
                .get(&url)
                .bearer_auth(key)
                .timeout(self.probe_timeout)
                .send()
        }))
        .await;

        let mut removed = Vec::new();
        for (key, status) in keys.into_iter().zip(statuses) {
            match status {
                Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                    warn!("removing API key {} rejected by the API", mask(&key));
                    self.remove_key(&key);
                    removed.push(key);
                }
                Ok(response) => debug!("key {} answered {}", mask(&key), response.status()),
                Err(e) => debug!("could not probe key {}: {}", mask(&key), e),
            }
        }

        removed
    }

    /// Logs into the developer portal and assembles `key_count` keys usable
    /// from the current public IP.
    ///
    /// Same-named keys bound to another IP are revoked, same-named keys bound
    /// to the current IP are adopted, and new ones are created while the
    /// account stays under [`MAX_KEYS_PER_ACCOUNT`]. The resulting keys are
    /// added to the ring and returned.
    pub async fn provision(&self) -> Result<Vec<String>, ProvisionError> {
        let (account, portal) = self.provisioner().ok_or(ProvisionError::MissingAccount)?;
        let key_count = account.key_count.clamp(1, MAX_KEYS_PER_ACCOUNT);

        let session = portal.login(&account.email, &account.password).await?;
        let ip = portal.external_ip(&session).await?;
        info!("provisioning {} keys for ip {}", key_count, ip);

        let existing = portal.list_keys().await?;
        let mut total = existing.len();
        let mut usable = Vec::new();

        for key in existing.into_iter().filter(|k| k.name == account.key_name) {
            if key.allows_ip(&ip) {
                if usable.len() < key_count {
                    debug!("adopting key {}", key.id);
                    usable.push(key.key);
                }
                continue;
            }

            info!("revoking key {} bound to {:?}", key.id, key.cidr_ranges);
            portal.revoke_key(&key.id).await?;
            total -= 1;
        }

        while usable.len() < key_count && total < MAX_KEYS_PER_ACCOUNT {
            let key = portal
                .create_key(&account.key_name, &account.key_description, &ip)
                .await?;
            info!("created key {} for ip {}", key.id, ip);
            total += 1;
            usable.push(key.key);
        }

        if usable.is_empty() {
            return Err(ProvisionError::NoUsableKey {
                key_name: account.key_name.clone(),
                reason: format!(
                    "the account already holds {} of {} keys",
                    total, MAX_KEYS_PER_ACCOUNT
                ),
            });
        }
        if usable.len() < key_count {
            warn!(
                "only {} of {} keys available, the account key limit is reached",
                usable.len(),
                key_count
            );
        }

        self.add_keys(usable.clone());
        Ok(usable)
    }

    /// Drops rejected keys then provisions replacements.
    ///
    /// Refreshes are serialized. A caller that waited for another refresh
    /// which changed the ring takes that result instead of refreshing again.
    ///
    /// Returns the number of keys held afterwards.
    pub async fn refresh(&self) -> Result<usize, ProvisionError> {
        let seen = self.keys();
        let _guard = self.refresh_lock.lock().await;

        if self.keys() != seen {
            debug!("keys refreshed while waiting, skipping refresh");
            return Ok(self.len());
        }

        let removed = self.revalidate().await;
        info!("{} keys removed during revalidation", removed.len());

        self.provision().await?;
        Ok(self.len())
    }
}

/// Shortens a key for logs.
fn mask(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::portal::{ApiKey, MockDeveloperPortal, PortalSession};
    use mockall::predicate::eq;

    fn account(key_count: usize) -> Account {
        Account {
            email: "me@example.com".to_string(),
            password: "secret".to_string(),
            key_name: "clanwatch".to_string(),
            key_count,
            key_description: "created by clanwatch".to_string(),
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            ip_echo_url: DEFAULT_IP_ECHO_URL.to_string(),
        }
    }

    fn api_key(id: &str, name: &str, ip: &str) -> ApiKey {
        ApiKey {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            cidr_ranges: vec![format!("{}/32", ip)],
            key: format!("tok-{}", id),
        }
    }

    fn logged_in_portal() -> MockDeveloperPortal {
        let mut portal = MockDeveloperPortal::new();
        portal.expect_login().times(1).returning(|_, _| {
            Ok(PortalSession {
                temporary_token: "token".to_string(),
            })
        });
        portal
            .expect_external_ip()
            .times(1)
            .returning(|_| Ok("1.2.3.4".to_string()));
        portal
    }

    #[test]
    fn test_cursor_wraps() {
        let mut cursor = RotationCursor::default();
        let picks: Vec<_> = (0..5).map(|_| cursor.advance(2).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0]);
        assert_eq!(cursor.advance(0), None);
    }

    #[test]
    fn test_current_rotates_round_robin() {
        let manager = KeyManager::new("http://localhost", vec!["a".into(), "b".into(), "c".into()]);

        let picks: Vec<_> = (0..7).map(|_| manager.current().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c", "a"]);
        assert!(picks.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_current_on_empty_ring() {
        let manager = KeyManager::new("http://localhost", vec![]);
        assert_eq!(manager.current(), None);
    }

    #[test]
    fn test_cursor_survives_removal() {
        let manager = KeyManager::new("http://localhost", vec!["a".into(), "b".into(), "c".into()]);
        manager.current();
        manager.current();

        assert!(manager.remove_key("c"));
        assert_eq!(manager.current().unwrap(), "a");
        assert_eq!(manager.current().unwrap(), "b");
    }

    #[test]
    fn test_add_keys_ignores_duplicates() {
        let manager = KeyManager::new("http://localhost", vec!["a".into()]);
        manager.add_keys(vec!["a".into(), "b".into(), "".into()]);
        assert_eq!(manager.keys(), vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotation_is_even() {
        let manager = Arc::new(KeyManager::new(
            "http://localhost",
            vec!["a".into(), "b".into(), "c".into()],
        ));

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.current().unwrap() })
            })
            .collect();

        let mut picks = Vec::new();
        for handle in handles {
            picks.push(handle.await.unwrap());
        }

        for key in ["a", "b", "c"] {
            assert_eq!(picks.iter().filter(|k| *k == key).count(), 10);
        }
    }

    #[tokio::test]
    async fn test_revalidate_removes_forbidden_keys() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/locations")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "1".into()))
            .match_header("authorization", "Bearer bad")
            .with_status(403)
            .with_body(r#"{"reason":"accessDenied.invalidIp","message":"Invalid IP"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/locations")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "1".into()))
            .match_header("authorization", "Bearer good")
            .with_status(200)
            .with_body(r#"{"items":[]}"#)
            .create_async()
            .await;

        let manager = KeyManager::new(&server.url(), vec!["bad".into(), "good".into()]);
        let removed = manager.revalidate().await;

        assert_eq!(removed, vec!["bad"]);
        assert_eq!(manager.keys(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_provision_adopts_revokes_and_creates() {
        let mut portal = logged_in_portal();
        portal.expect_list_keys().times(1).returning(|| {
            Ok(vec![
                api_key("k1", "clanwatch", "1.2.3.4"),
                api_key("k2", "clanwatch", "9.9.9.9"),
                api_key("k3", "other-app", "9.9.9.9"),
            ])
        });
        portal
            .expect_revoke_key()
            .with(eq("k2"))
            .times(1)
            .returning(|_| Ok(()));
        portal
            .expect_create_key()
            .with(eq("clanwatch"), eq("created by clanwatch"), eq("1.2.3.4"))
            .times(1)
            .returning(|name, _, ip| Ok(api_key("k4", name, ip)));

        let manager = KeyManager::new("http://localhost", vec![])
            .with_account(account(2), Arc::new(portal));

        let keys = manager.provision().await.unwrap();
        assert_eq!(keys, vec!["tok-k1", "tok-k4"]);
        assert_eq!(manager.keys(), vec!["tok-k1", "tok-k4"]);
    }

    #[tokio::test]
    async fn test_provision_respects_account_limit() {
        let mut portal = logged_in_portal();
        portal.expect_list_keys().times(1).returning(|| {
            Ok((0..MAX_KEYS_PER_ACCOUNT)
                .map(|i| api_key(&format!("k{}", i), "other-app", "9.9.9.9"))
                .collect())
        });
        portal.expect_create_key().times(0);

        let manager = KeyManager::new("http://localhost", vec![])
            .with_account(account(1), Arc::new(portal));

        let error = manager.provision().await.unwrap_err();
        assert!(matches!(error, ProvisionError::NoUsableKey { .. }));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_provision_fails_on_login_error() {
        let mut portal = MockDeveloperPortal::new();
        portal.expect_login().times(1).returning(|_, _| {
            Err(ProvisionError::Login {
                status: 403,
                message: "invalid credentials".to_string(),
            })
        });
        portal.expect_list_keys().times(0);

        let manager = KeyManager::new("http://localhost", vec![])
            .with_account(account(1), Arc::new(portal));

        assert!(matches!(
            manager.provision().await,
            Err(ProvisionError::Login { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_provision_without_account() {
        let manager = KeyManager::new("http://localhost", vec!["a".into()]);
        assert!(matches!(
            manager.provision().await,
            Err(ProvisionError::MissingAccount)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_log_in_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/locations")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "1".into()))
            .match_header("authorization", "Bearer old")
            .with_status(403)
            .with_body(r#"{"reason":"accessDenied.invalidIp","message":"Invalid IP"}"#)
            .create_async()
            .await;

        let mut portal = logged_in_portal();
        portal.expect_list_keys().times(1).returning(|| Ok(vec![]));
        portal
            .expect_create_key()
            .times(1)
            .returning(|name, _, ip| Ok(api_key("k1", name, ip)));

        let manager = KeyManager::new(&server.url(), vec!["old".into()])
            .with_account(account(1), Arc::new(portal));

        let (first, second) = tokio::join!(manager.refresh(), manager.refresh());
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 1);
        assert_eq!(manager.keys(), vec!["tok-k1"]);
    }

    #[tokio::test]
    async fn test_hung_revalidation_keeps_the_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/locations")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "1".into()))
            .with_status_code_from_request(|_| {
                std::thread::sleep(Duration::from_millis(500));
                403
            })
            .create_async()
            .await;

        let manager = KeyManager::new(&server.url(), vec!["slow".into()])
            .with_probe_timeout(Duration::from_millis(50));

        let start = std::time::Instant::now();
        let removed = manager.revalidate().await;

        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(removed.is_empty());
        assert_eq!(manager.keys(), vec!["slow"]);
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("abcdefghij"), "…efghij");
        assert_eq!(mask("abc"), "…abc");
    }
}
