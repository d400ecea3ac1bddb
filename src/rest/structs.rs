//! Snapshots of the entities returned by the REST API.
//!
//! Only the fields the change detection compares are modelled. Unknown fields
//! of the payloads are ignored.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag the API uses for a league round slot that is not scheduled yet.
pub const UNSCHEDULED_WAR_TAG: &str = "#0";

/// Clan from `/clans/{clanTag}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clan {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `open`, `inviteOnly` or `closed`
    #[serde(rename = "type", default)]
    pub clan_type: String,
    #[serde(default)]
    pub clan_level: u32,
    #[serde(default)]
    pub clan_points: u32,
    #[serde(default)]
    pub required_trophies: u32,
    #[serde(default)]
    pub war_frequency: Option<String>,
    #[serde(default)]
    pub war_win_streak: u32,
    #[serde(default)]
    pub war_wins: u32,
    #[serde(default)]
    pub is_war_log_public: bool,
    /// Member count
    #[serde(default)]
    pub members: u32,
    #[serde(default)]
    pub member_list: Vec<ClanMember>,
}

impl Clan {
    pub fn member(&self, tag: &str) -> Option<&ClanMember> {
        self.member_list.iter().find(|member| member.tag == tag)
    }
}

impl fmt::Display for Clan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tag={}, name={}, level={}, members={}",
            self.tag, self.name, self.clan_level, self.members
        )
    }
}

/// Entry of [`Clan::member_list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanMember {
    pub tag: String,
    pub name: String,
    /// `member`, `admin`, `coLeader` or `leader`
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub exp_level: u32,
    #[serde(default)]
    pub trophies: u32,
    #[serde(default)]
    pub clan_rank: u32,
    #[serde(default)]
    pub donations: u32,
    #[serde(default)]
    pub donations_received: u32,
}

impl fmt::Display for ClanMember {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tag={}, name={}, role={}", self.tag, self.name, self.role)
    }
}

/// Player from `/players/{playerTag}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub exp_level: u32,
    #[serde(default)]
    pub town_hall_level: u32,
    #[serde(default)]
    pub trophies: u32,
    #[serde(default)]
    pub best_trophies: u32,
    #[serde(default)]
    pub war_stars: u32,
    #[serde(default)]
    pub attack_wins: u32,
    #[serde(default)]
    pub defense_wins: u32,
    #[serde(default)]
    pub donations: u32,
    #[serde(default)]
    pub donations_received: u32,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub clan: Option<PlayerClan>,
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tag={}, name={}, town_hall={}, trophies={}",
            self.tag, self.name, self.town_hall_level, self.trophies
        )
    }
}

/// Clan summary embedded in a [`Player`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerClan {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub clan_level: u32,
}

/// State of a war.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WarState {
    NotInWar,
    Preparation,
    InWar,
    WarEnded,
    #[serde(other)]
    Unknown,
}

/// War from `/clans/{clanTag}/currentwar` or `/clanwarleagues/wars/{warTag}`.
///
/// Wars returned by the client are oriented so that [`ClanWar::clan`] is the
/// tracked clan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanWar {
    pub state: WarState,
    #[serde(default)]
    pub team_size: u32,
    #[serde(default)]
    pub preparation_start_time: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub clan: WarClan,
    #[serde(default)]
    pub opponent: WarClan,
    /// Set for league wars only
    #[serde(default)]
    pub war_tag: Option<String>,
}

impl ClanWar {
    /// Returns `true` when `clan_tag` is one of the two sides.
    pub fn involves(&self, clan_tag: &str) -> bool {
        self.clan.tag.as_deref() == Some(clan_tag) || self.opponent.tag.as_deref() == Some(clan_tag)
    }

    /// Returns the war seen from `clan_tag`, swapping the sides when needed.
    pub fn oriented_to(mut self, clan_tag: &str) -> Self {
        if self.opponent.tag.as_deref() == Some(clan_tag) {
            std::mem::swap(&mut self.clan, &mut self.opponent);
        }
        self
    }
}

impl fmt::Display for ClanWar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "state={:?}, war_tag={:?}, clan={:?}, opponent={:?}",
            self.state, self.war_tag, self.clan.tag, self.opponent.tag
        )
    }
}

/// One side of a [`ClanWar`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarClan {
    /// Absent while not in war
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clan_level: u32,
    #[serde(default)]
    pub attacks: u32,
    #[serde(default)]
    pub stars: u32,
    #[serde(default)]
    pub destruction_percentage: f64,
}

/// League group from `/clans/{clanTag}/currentwar/leaguegroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanWarLeagueGroup {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub season: String,
    #[serde(default)]
    pub clans: Vec<LeagueClan>,
    #[serde(default)]
    pub rounds: Vec<LeagueRoundTags>,
}

impl ClanWarLeagueGroup {
    /// War tags of the scheduled rounds, the most recent round first.
    pub fn scheduled_rounds(&self) -> Vec<Vec<String>> {
        self.rounds
            .iter()
            .rev()
            .map(|round| {
                round
                    .war_tags
                    .iter()
                    .filter(|tag| tag.as_str() != UNSCHEDULED_WAR_TAG)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|tags| !tags.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeagueClan {
    pub tag: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeagueRoundTags {
    #[serde(default)]
    pub war_tags: Vec<String>,
}

/// Position under which a war of a tracked clan is stored.
///
/// During a league a clan has up to two wars at once: the round being fought
/// and the next round in preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarSlot {
    /// Battle day of a league round, or a regular war
    Current,
    /// League round in preparation
    Preparation,
}

impl WarSlot {
    pub fn index(&self) -> u8 {
        match self {
            WarSlot::Current => 1,
            WarSlot::Preparation => 2,
        }
    }

    /// Snapshot key of the war of `clan_tag` in this slot, e.g. `#2PP:1`.
    pub fn key(&self, clan_tag: &str) -> String {
        format!("{}:{}", clan_tag, self.index())
    }
}

/// Selector for a league war relative to the round being fought.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeagueRound {
    /// The latest round past its preparation day
    Current,
    /// The round before [`LeagueRound::Current`]
    Previous,
}
