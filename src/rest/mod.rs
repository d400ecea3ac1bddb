//! REST API access under a hard rate limit.
//!
//! # Modules
//!
//! - `throttler` - Pacing strategies shared by every request
//! - `cache` - Time-to-live store for responses
//! - `portal` - Developer portal client used to create and revoke keys
//! - `keys` - Rotating key pool with revalidation and provisioning
//! - `executor` - Request pipeline: cache, throttle, retries, key refresh
//! - `client` - Typed endpoints and the [`Fetcher`] seam
//! - `structs` - Snapshots of clans, players and wars
//! - `error` - Request and provisioning errors
//!
//! # Examples
//!
//! ```no_run
//! use clanwatch::rest::{BatchThrottler, KeyManager, RequestExecutor, RestClient};
//! use std::{sync::Arc, time::Duration};
//!
//! let url = "https://api.clashofclans.com/v1";
//! let keys = Arc::new(KeyManager::new(url, vec!["key".to_string()]));
//! let executor = RequestExecutor::new(url, keys)
//!     .with_throttler(Arc::new(BatchThrottler::new(10, Duration::from_secs(1))));
//! let client = RestClient::new(executor);
//! ```

mod cache;
mod client;
mod error;
mod executor;
mod keys;
mod portal;
mod structs;
mod throttler;

pub use crate::rest::cache::{CacheEntry, CacheStore};
#[cfg(test)]
pub use crate::rest::client::MockFetcher;
pub use crate::rest::client::{Fetcher, RestClient};
pub use crate::rest::error::{ErrorKind, ProvisionError, RequestError};
pub use crate::rest::executor::{RequestExecutor, RequestOptions, Response};
pub use crate::rest::keys::{Account, KeyManager};
pub use crate::rest::portal::{ApiKey, DeveloperPortal, PortalClient, PortalSession};
pub use crate::rest::structs::{
    Clan, ClanMember, ClanWar, ClanWarLeagueGroup, LeagueRound, Player, PlayerClan, WarClan, WarSlot,
    WarState,
};
pub use crate::rest::throttler::{BatchThrottler, QueueThrottler, Throttler};
