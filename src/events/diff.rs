//! Field-by-field comparison of two snapshots of the same entity.
//!
//! Comparators return discrete change records instead of a yes/no answer, so
//! subscribers can tell what changed without diffing again.

use std::fmt;

use crate::rest::{Clan, ClanMember, ClanWar, Player};

/// A field whose value differs between two snapshots.
///
/// Values are rendered with their `Debug` representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Field path, e.g. `clan_level` or `opponent.stars`
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

impl FieldChange {
    fn new<T: fmt::Debug>(field: &'static str, old: &T, new: &T) -> Self {
        FieldChange {
            field,
            old: format!("{:?}", old),
            new: format!("{:?}", new),
        }
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.old, self.new)
    }
}

/// A change between two clan snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClanChange {
    MemberAdded(ClanMember),
    MemberRemoved(ClanMember),
    Field(FieldChange),
}

/// Pushes a [`FieldChange`] for every listed field that differs.
macro_rules! compare_fields {
    ($changes:ident, $old:ident, $new:ident, $($name:literal => $($path:ident).+),+ $(,)?) => {
        $(
            if $old.$($path).+ != $new.$($path).+ {
                $changes.push(FieldChange::new($name, &$old.$($path).+, &$new.$($path).+));
            }
        )+
    };
}

/// Compares two snapshots of a clan.
///
/// Members joining come first in the order of the new member list, then
/// members leaving in the order of the old list, then the field deltas.
/// Members are matched by tag.
pub fn clan_changes(old: &Clan, new: &Clan) -> Vec<ClanChange> {
    let mut changes: Vec<ClanChange> = new
        .member_list
        .iter()
        .filter(|member| old.member(&member.tag).is_none())
        .cloned()
        .map(ClanChange::MemberAdded)
        .collect();

    changes.extend(
        old.member_list
            .iter()
            .filter(|member| new.member(&member.tag).is_none())
            .cloned()
            .map(ClanChange::MemberRemoved),
    );

    let mut fields = Vec::new();
    compare_fields!(fields, old, new,
        "name" => name,
        "description" => description,
        "type" => clan_type,
        "clan_level" => clan_level,
        "clan_points" => clan_points,
        "required_trophies" => required_trophies,
        "war_frequency" => war_frequency,
        "war_win_streak" => war_win_streak,
        "war_wins" => war_wins,
        "is_war_log_public" => is_war_log_public,
        "members" => members,
    );
    changes.extend(fields.into_iter().map(ClanChange::Field));

    changes
}

/// Compares two snapshots of a player.
///
/// The player clan is compared by tag only.
pub fn player_changes(old: &Player, new: &Player) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    compare_fields!(changes, old, new,
        "name" => name,
        "exp_level" => exp_level,
        "town_hall_level" => town_hall_level,
        "trophies" => trophies,
        "best_trophies" => best_trophies,
        "war_stars" => war_stars,
        "attack_wins" => attack_wins,
        "defense_wins" => defense_wins,
        "donations" => donations,
        "donations_received" => donations_received,
        "role" => role,
    );

    let old_clan = old.clan.as_ref().map(|clan| clan.tag.as_str());
    let new_clan = new.clan.as_ref().map(|clan| clan.tag.as_str());
    if old_clan != new_clan {
        changes.push(FieldChange::new("clan", &old_clan, &new_clan));
    }

    changes
}

/// Compares two snapshots of a war, both seen from the tracked clan.
pub fn war_changes(old: &ClanWar, new: &ClanWar) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    compare_fields!(changes, old, new,
        "state" => state,
        "war_tag" => war_tag,
        "team_size" => team_size,
        "start_time" => start_time,
        "end_time" => end_time,
        "opponent" => opponent.tag,
        "clan.attacks" => clan.attacks,
        "clan.stars" => clan.stars,
        "clan.destruction_percentage" => clan.destruction_percentage,
        "opponent.attacks" => opponent.attacks,
        "opponent.stars" => opponent.stars,
        "opponent.destruction_percentage" => opponent.destruction_percentage,
    );
    changes
}
