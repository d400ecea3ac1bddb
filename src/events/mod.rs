//! Change detection over polled snapshots.
//!
//! # Modules
//!
//! - `engine` - Polling loops, snapshot store and predicate evaluation
//! - `event` - Events published on the broadcast channel
//! - `diff` - Field level comparison of two snapshots
//! - `maintenance` - Maintenance break detection
//! - `season` - Monthly season boundaries and their timer
//! - `scheduler` - Repeating background tasks

mod diff;
mod engine;
mod event;
mod maintenance;
mod scheduler;
mod season;

pub use crate::events::diff::{ClanChange, FieldChange, clan_changes, player_changes, war_changes};
pub use crate::events::engine::{EVENT_CHANNEL_CAPACITY, PollingEngine, PollingSettings, Predicate};
pub use crate::events::event::PollingEvent;
pub use crate::events::maintenance::{MaintenanceDetector, MaintenanceState, MaintenanceTransition};
pub use crate::events::scheduler::RepeatingTask;
pub use crate::events::season::{
    Clock, InstantClock, SeasonWait, SystemClock, next_season_start, run_season_timer, season_id,
};
