//! Configuration of the clanwatch binary.
//!
//! The configuration is read from a YAML file and merged with environment
//! variables prefixed with `CLANWATCH_`, nested keys being separated by `__`.
//!
//! # Configuration File Format
//!
//! ```yaml
//! rest:
//!   base_url: "https://api.clashofclans.com/v1"
//!   keys: ["eyJ0eXAiOiJKV1Qi..."]
//!   retry_limit: 2
//!   cache: true
//!   request_timeout_ms: 5000
//!   throttler:
//!     strategy: batch
//!     rate_limit: 10
//!     window_ms: 1000
//!
//! # Optional, keys are created through the developer portal
//! account:
//!   email: "me@example.com"
//!   password: "secret"
//!
//! polling:
//!   clans: ["#2PP"]
//!   players: ["#9L2PQR"]
//!   wars: ["#2PP"]
//!   maintenance: true
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export CLANWATCH_ACCOUNT__PASSWORD="secret-from-env"
//! export CLANWATCH_REST__RETRY_LIMIT=3
//! ```

use std::{path::Path, sync::Arc, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

use crate::{
    events::PollingSettings,
    rest::{Account, BatchThrottler, QueueThrottler, Throttler},
};

/// Prefix of the environment variables merged over the file.
pub const ENV_PREFIX: &str = "CLANWATCH_";

pub const DEFAULT_BASE_URL: &str = "https://api.clashofclans.com/v1";

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rest: Rest,
    /// Developer account, enables key provisioning when set
    #[serde(default)]
    pub account: Option<Account>,
    #[serde(default)]
    pub polling: Polling,
}

/// Request pipeline settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Rest {
    pub base_url: String,
    pub keys: Vec<String>,
    /// Retries of a request after a transport failure
    pub retry_limit: u32,
    pub cache: bool,
    /// Per request deadline, `0` disables it
    pub request_timeout_ms: u64,
    pub cache_sweep_interval_secs: u64,
    pub throttler: Option<ThrottlerConfig>,
}

impl Default for Rest {
    fn default() -> Self {
        Rest {
            base_url: DEFAULT_BASE_URL.to_owned(),
            keys: Vec::new(),
            retry_limit: 0,
            cache: false,
            request_timeout_ms: 0,
            cache_sweep_interval_secs: 300,
            throttler: None,
        }
    }
}

impl Rest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Builds the configured throttler, if any.
    pub fn build_throttler(&self) -> Option<Arc<dyn Throttler>> {
        match self.throttler.as_ref()? {
            ThrottlerConfig::Batch {
                rate_limit,
                window_ms,
            } => Some(Arc::new(BatchThrottler::new(
                *rate_limit,
                Duration::from_millis(*window_ms),
            ))),
            ThrottlerConfig::Queue { sleep_time_ms } => Some(Arc::new(QueueThrottler::new(
                Duration::from_millis(*sleep_time_ms),
            ))),
        }
    }
}

/// Pacing strategy of the outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ThrottlerConfig {
    /// At most `rate_limit` requests per window
    Batch { rate_limit: u32, window_ms: u64 },
    /// One request every `sleep_time_ms`
    Queue { sleep_time_ms: u64 },
}

/// Tracked tags and loop periods.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub clans: Vec<String>,
    pub players: Vec<String>,
    /// Clans whose wars are tracked
    pub wars: Vec<String>,
    pub clan_interval_secs: u64,
    pub player_interval_secs: u64,
    pub war_interval_secs: u64,
    pub maintenance: bool,
    pub maintenance_interval_secs: u64,
    pub season: bool,
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            clans: Vec::new(),
            players: Vec::new(),
            wars: Vec::new(),
            clan_interval_secs: 60,
            player_interval_secs: 60,
            war_interval_secs: 60,
            maintenance: true,
            maintenance_interval_secs: 10,
            season: true,
        }
    }
}

impl Polling {
    pub fn settings(&self) -> PollingSettings {
        PollingSettings {
            clan_interval: Duration::from_secs(self.clan_interval_secs),
            player_interval: Duration::from_secs(self.player_interval_secs),
            war_interval: Duration::from_secs(self.war_interval_secs),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            season: self.season,
        }
    }
}

impl Config {
    /// Sources of the configuration, the environment overriding the file.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and checks the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the sources do not deserialize, or if neither keys nor an
    /// account are configured.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, figment::Error> {
        let mut config: Config = Self::figment(path).extract()?;

        while config.rest.base_url.ends_with('/') {
            config.rest.base_url.pop();
        }

        if config.rest.keys.is_empty() && config.account.is_none() {
            return Err(figment::Error::from(
                "either rest.keys or account must be set".to_string(),
            ));
        }

        Ok(config)
    }
}
