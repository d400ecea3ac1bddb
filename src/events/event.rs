//! Events published by the polling engine.

use std::{fmt, sync::Arc};

use tokio::time::Duration;

use crate::{
    events::diff::FieldChange,
    rest::{Clan, ClanMember, ClanWar, Player},
};

/// An event of the polling engine event stream.
///
/// Snapshots are shared behind [`Arc`] so that every subscriber receives the
/// same immutable value.
#[derive(Debug, Clone)]
pub enum PollingEvent {
    ClanLoopStart,
    ClanLoopEnd,
    PlayerLoopStart,
    PlayerLoopEnd,
    WarLoopStart,
    WarLoopEnd,
    /// A new monthly season started, `season_id` is `YYYY-MM`
    NewSeasonStart { season_id: String },
    MaintenanceStart,
    /// The maintenance break ended after `duration`
    MaintenanceEnd { duration: Duration },
    /// A predicate failed
    Error(Arc<anyhow::Error>),
    /// A fetch failed and the identifier was skipped for this cycle
    Debug {
        path: String,
        status: u16,
        message: String,
    },
    ClanMemberAdd {
        clan: Arc<Clan>,
        member: ClanMember,
    },
    ClanMemberRemove {
        clan: Arc<Clan>,
        member: ClanMember,
    },
    ClanUpdate {
        old: Arc<Clan>,
        new: Arc<Clan>,
        changes: Vec<FieldChange>,
    },
    PlayerUpdate {
        old: Arc<Player>,
        new: Arc<Player>,
        changes: Vec<FieldChange>,
    },
    WarUpdate {
        /// War snapshot key, e.g. `#2PP:1`
        key: String,
        old: Arc<ClanWar>,
        new: Arc<ClanWar>,
        changes: Vec<FieldChange>,
    },
    /// A clan predicate matched
    Clan {
        name: String,
        old: Arc<Clan>,
        new: Arc<Clan>,
    },
    /// A player predicate matched
    Player {
        name: String,
        old: Arc<Player>,
        new: Arc<Player>,
    },
    /// A war predicate matched
    War {
        name: String,
        key: String,
        old: Arc<ClanWar>,
        new: Arc<ClanWar>,
    },
}

impl PollingEvent {
    /// Name of the event, the registered name for predicate events.
    pub fn name(&self) -> &str {
        match self {
            Self::ClanLoopStart => "clanLoopStart",
            Self::ClanLoopEnd => "clanLoopEnd",
            Self::PlayerLoopStart => "playerLoopStart",
            Self::PlayerLoopEnd => "playerLoopEnd",
            Self::WarLoopStart => "warLoopStart",
            Self::WarLoopEnd => "warLoopEnd",
            Self::NewSeasonStart { .. } => "newSeasonStart",
            Self::MaintenanceStart => "maintenanceStart",
            Self::MaintenanceEnd { .. } => "maintenanceEnd",
            Self::Error(_) => "error",
            Self::Debug { .. } => "debug",
            Self::ClanMemberAdd { .. } => "clanMemberAdd",
            Self::ClanMemberRemove { .. } => "clanMemberRemove",
            Self::ClanUpdate { .. } => "clanUpdate",
            Self::PlayerUpdate { .. } => "playerUpdate",
            Self::WarUpdate { .. } => "warUpdate",
            Self::Clan { name, .. } | Self::Player { name, .. } | Self::War { name, .. } => {
                name.as_str()
            }
        }
    }
}

impl fmt::Display for PollingEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NewSeasonStart { season_id } => write!(f, "{} {}", self.name(), season_id),
            Self::MaintenanceEnd { duration } => write!(f, "{} after {:?}", self.name(), duration),
            Self::Error(error) => write!(f, "{}: {:#}", self.name(), error),
            Self::Debug {
                path,
                status,
                message,
            } => write!(f, "{} {} ({}): {}", self.name(), path, status, message),
            Self::ClanMemberAdd { clan, member } | Self::ClanMemberRemove { clan, member } => {
                write!(f, "{} {} in {}", self.name(), member.tag, clan.tag)
            }
            Self::ClanUpdate { new, changes, .. } => {
                write!(f, "{} {} ({} changes)", self.name(), new.tag, changes.len())
            }
            Self::PlayerUpdate { new, changes, .. } => {
                write!(f, "{} {} ({} changes)", self.name(), new.tag, changes.len())
            }
            Self::WarUpdate { key, changes, .. } => {
                write!(f, "{} {} ({} changes)", self.name(), key, changes.len())
            }
            Self::Clan { new, .. } => write!(f, "{} {}", self.name(), new.tag),
            Self::Player { new, .. } => write!(f, "{} {}", self.name(), new.tag),
            Self::War { key, .. } => write!(f, "{} {}", self.name(), key),
            _ => f.write_str(self.name()),
        }
    }
}
