//! Polling loops turning successive snapshots into events.
//!
//! This module provides the [`PollingEngine`] that polls the tracked clans,
//! players and wars, compares each snapshot with the previous one and
//! publishes the differences on a broadcast channel.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use indexmap::IndexSet;
use log::{debug, info, warn};
use tokio::{
    sync::{Mutex, broadcast},
    time::{Duration, Instant},
};

use crate::{
    events::{
        PollingEvent,
        diff::{ClanChange, clan_changes, player_changes, war_changes},
        maintenance::{MaintenanceDetector, MaintenanceTransition},
        scheduler::RepeatingTask,
        season::{Clock, SystemClock, run_season_timer},
    },
    rest::{Clan, ClanWar, Fetcher, LeagueRound, Player, RequestError, WarSlot},
    utils::normalize_tag,
};

/// Capacity of the event channel; slow subscribers lag past it.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Predicate deciding whether a named event fires for a transition `(old, new)`.
pub type Predicate<T> = Arc<dyn Fn(&T, &T) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Clone)]
struct Subscription<T> {
    name: String,
    filter: Predicate<T>,
}

/// Periods of the polling loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingSettings {
    pub clan_interval: Duration,
    pub player_interval: Duration,
    pub war_interval: Duration,
    pub maintenance_interval: Duration,
    /// Publish [`PollingEvent::NewSeasonStart`] at season boundaries
    pub season: bool,
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            clan_interval: Duration::from_secs(60),
            player_interval: Duration::from_secs(60),
            war_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(10),
            season: true,
        }
    }
}

struct Inner<F> {
    fetcher: F,
    settings: PollingSettings,
    clock: Arc<dyn Clock>,
    sender: broadcast::Sender<PollingEvent>,

    clan_tags: Mutex<IndexSet<String>>,
    player_tags: Mutex<IndexSet<String>>,
    war_tags: Mutex<IndexSet<String>>,

    clans: Mutex<HashMap<String, Arc<Clan>>>,
    players: Mutex<HashMap<String, Arc<Player>>>,
    /// Keyed by [`WarSlot::key`]
    wars: Mutex<HashMap<String, Arc<ClanWar>>>,

    clan_events: Mutex<Vec<Subscription<Clan>>>,
    player_events: Mutex<Vec<Subscription<Player>>>,
    war_events: Mutex<Vec<Subscription<ClanWar>>>,

    maintenance: Mutex<MaintenanceDetector>,
    maintenance_tracking: AtomicBool,

    tasks: Mutex<Vec<RepeatingTask>>,
}

/// Polls tracked entities and publishes what changed.
///
/// Each category runs its own loop. Within a loop the tracked tags are polled
/// one after the other in insertion order. The first snapshot of a tag only
/// seeds the store; from the second one on, every poll publishes:
///
/// 1. the built-in change events (`ClanMemberAdd`, `ClanMemberRemove`,
///    `ClanUpdate`, `PlayerUpdate`, `WarUpdate`),
/// 2. one event per registered predicate that matched, in registration order.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::events::{PollingEngine, PollingSettings};
/// # use clanwatch::rest::RestClient;
///
/// # async fn example(client: RestClient) {
/// let engine = PollingEngine::new(client, PollingSettings::default());
/// engine.add_clans(["#2PP"]).await;
/// engine
///     .set_clan_event("levelUp", |old, new| Ok(new.clan_level > old.clan_level))
///     .await;
///
/// let mut events = engine.subscribe();
/// engine.start().await;
/// while let Ok(event) = events.recv().await {
///     println!("{}", event);
/// }
/// # }
/// ```
pub struct PollingEngine<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for PollingEngine<F> {
    fn clone(&self) -> Self {
        PollingEngine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fetcher + 'static> PollingEngine<F> {
    /// Create a new [PollingEngine] using the system clock.
    ///
    /// # Arguments
    ///
    /// * `fetcher` - An implementation of the [Fetcher] trait to read the API.
    /// * `settings` - Periods of the loops.
    pub fn new(fetcher: F, settings: PollingSettings) -> Self {
        Self::with_clock(fetcher, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(fetcher: F, settings: PollingSettings, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        PollingEngine {
            inner: Arc::new(Inner {
                fetcher,
                settings,
                clock,
                sender,
                clan_tags: Mutex::new(IndexSet::new()),
                player_tags: Mutex::new(IndexSet::new()),
                war_tags: Mutex::new(IndexSet::new()),
                clans: Mutex::new(HashMap::new()),
                players: Mutex::new(HashMap::new()),
                wars: Mutex::new(HashMap::new()),
                clan_events: Mutex::new(Vec::new()),
                player_events: Mutex::new(Vec::new()),
                war_events: Mutex::new(Vec::new()),
                maintenance: Mutex::new(MaintenanceDetector::new()),
                maintenance_tracking: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a receiver of every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PollingEvent> {
        self.inner.sender.subscribe()
    }

    fn emit(&self, event: PollingEvent) {
        debug!("emit {}", event);
        // No receiver is not an error, events are just dropped
        let _ = self.inner.sender.send(event);
    }

    fn emit_debug(&self, error: &RequestError) {
        debug!("skipping {}: {}", error.path, error);
        self.emit(PollingEvent::Debug {
            path: error.path.clone(),
            status: error.status,
            message: error.message.clone(),
        });
    }

    pub async fn add_clans<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        add_tags(&self.inner.clan_tags, tags).await;
    }

    /// Stops tracking clans and forgets their snapshots.
    pub async fn remove_clans<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = remove_tags(&self.inner.clan_tags, tags).await;
        let mut clans = self.inner.clans.lock().await;
        for tag in removed {
            clans.remove(&tag);
        }
    }

    pub async fn add_players<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        add_tags(&self.inner.player_tags, tags).await;
    }

    /// Stops tracking players and forgets their snapshots.
    pub async fn remove_players<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = remove_tags(&self.inner.player_tags, tags).await;
        let mut players = self.inner.players.lock().await;
        for tag in removed {
            players.remove(&tag);
        }
    }

    /// Tracks the wars of the given clans.
    pub async fn add_wars<I, S>(&self, clan_tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        add_tags(&self.inner.war_tags, clan_tags).await;
    }

    /// Stops tracking the wars of the given clans and forgets both slots.
    pub async fn remove_wars<I, S>(&self, clan_tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = remove_tags(&self.inner.war_tags, clan_tags).await;
        let mut wars = self.inner.wars.lock().await;
        for tag in removed {
            for slot in [WarSlot::Current, WarSlot::Preparation] {
                wars.remove(&slot.key(&tag));
            }
        }
    }

    pub async fn clan_tags(&self) -> Vec<String> {
        self.inner.clan_tags.lock().await.iter().cloned().collect()
    }

    pub async fn player_tags(&self) -> Vec<String> {
        self.inner.player_tags.lock().await.iter().cloned().collect()
    }

    pub async fn war_tags(&self) -> Vec<String> {
        self.inner.war_tags.lock().await.iter().cloned().collect()
    }

    /// Last snapshot of a tracked clan.
    pub async fn cached_clan(&self, tag: &str) -> Option<Arc<Clan>> {
        self.inner.clans.lock().await.get(&normalize_tag(tag)).cloned()
    }

    pub async fn cached_player(&self, tag: &str) -> Option<Arc<Player>> {
        self.inner.players.lock().await.get(&normalize_tag(tag)).cloned()
    }

    pub async fn cached_war(&self, clan_tag: &str, slot: WarSlot) -> Option<Arc<ClanWar>> {
        let key = slot.key(&normalize_tag(clan_tag));
        self.inner.wars.lock().await.get(&key).cloned()
    }

    /// Registers a clan predicate publishing [`PollingEvent::Clan`] under `name`.
    pub async fn set_clan_event<P>(&self, name: &str, filter: P)
    where
        P: Fn(&Clan, &Clan) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.inner.clan_events.lock().await.push(Subscription {
            name: name.to_owned(),
            filter: Arc::new(filter),
        });
    }

    /// Registers a player predicate publishing [`PollingEvent::Player`] under `name`.
    pub async fn set_player_event<P>(&self, name: &str, filter: P)
    where
        P: Fn(&Player, &Player) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.inner.player_events.lock().await.push(Subscription {
            name: name.to_owned(),
            filter: Arc::new(filter),
        });
    }

    /// Registers a war predicate publishing [`PollingEvent::War`] under `name`.
    pub async fn set_war_event<P>(&self, name: &str, filter: P)
    where
        P: Fn(&ClanWar, &ClanWar) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.inner.war_events.lock().await.push(Subscription {
            name: name.to_owned(),
            filter: Arc::new(filter),
        });
    }

    /// Enables the maintenance probe. Disabled, it issues no request at all.
    pub fn set_maintenance_tracking(&self, enabled: bool) {
        self.inner
            .maintenance_tracking
            .store(enabled, Ordering::SeqCst);
    }

    /// Starts every loop, restarting them if already running.
    pub async fn start(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        tasks.clear();

        let settings = &self.inner.settings;
        info!("starting polling loops");

        let engine = self.clone();
        tasks.push(RepeatingTask::spawn("clan loop", settings.clan_interval, move || {
            let engine = engine.clone();
            async move { engine.run_clan_cycle().await }
        }));

        let engine = self.clone();
        tasks.push(RepeatingTask::spawn("player loop", settings.player_interval, move || {
            let engine = engine.clone();
            async move { engine.run_player_cycle().await }
        }));

        let engine = self.clone();
        tasks.push(RepeatingTask::spawn("war loop", settings.war_interval, move || {
            let engine = engine.clone();
            async move { engine.run_war_cycle().await }
        }));

        let engine = self.clone();
        tasks.push(RepeatingTask::spawn(
            "maintenance loop",
            settings.maintenance_interval,
            move || {
                let engine = engine.clone();
                async move { engine.run_maintenance_cycle().await }
            },
        ));

        if settings.season {
            let clock = Arc::clone(&self.inner.clock);
            let sender = self.inner.sender.clone();
            tasks.push(RepeatingTask::spawn_future(
                "season timer",
                run_season_timer(clock, sender),
            ));
        }
    }

    /// Stops every loop. Snapshots and subscriptions are kept.
    pub async fn stop(&self) {
        info!("stopping polling loops");
        self.inner.tasks.lock().await.clear();
    }

    /// Polls every tracked clan once.
    pub async fn run_clan_cycle(&self) {
        self.emit(PollingEvent::ClanLoopStart);

        for tag in self.clan_tags().await {
            match self.inner.fetcher.clan(&tag).await {
                Ok(clan) => self.handle_clan(&tag, clan).await,
                Err(e) => self.emit_debug(&e),
            }
        }

        self.emit(PollingEvent::ClanLoopEnd);
    }

    async fn handle_clan(&self, tag: &str, clan: Clan) {
        let new = Arc::new(clan);
        let subscriptions = self.inner.clan_events.lock().await.clone();
        let old = self
            .inner
            .clans
            .lock()
            .await
            .insert(tag.to_owned(), Arc::clone(&new));

        let Some(old) = old else {
            debug!("seeded clan {}", tag);
            return;
        };

        let mut fields = Vec::new();
        for change in clan_changes(&old, &new) {
            match change {
                ClanChange::MemberAdded(member) => self.emit(PollingEvent::ClanMemberAdd {
                    clan: Arc::clone(&new),
                    member,
                }),
                ClanChange::MemberRemoved(member) => self.emit(PollingEvent::ClanMemberRemove {
                    clan: Arc::clone(&new),
                    member,
                }),
                ClanChange::Field(field) => fields.push(field),
            }
        }
        if !fields.is_empty() {
            self.emit(PollingEvent::ClanUpdate {
                old: Arc::clone(&old),
                new: Arc::clone(&new),
                changes: fields,
            });
        }

        self.evaluate(&subscriptions, &old, &new, |name, old, new| {
            PollingEvent::Clan { name, old, new }
        });
    }

    /// Polls every tracked player once.
    pub async fn run_player_cycle(&self) {
        self.emit(PollingEvent::PlayerLoopStart);

        for tag in self.player_tags().await {
            match self.inner.fetcher.player(&tag).await {
                Ok(player) => self.handle_player(&tag, player).await,
                Err(e) => self.emit_debug(&e),
            }
        }

        self.emit(PollingEvent::PlayerLoopEnd);
    }

    async fn handle_player(&self, tag: &str, player: Player) {
        let new = Arc::new(player);
        let subscriptions = self.inner.player_events.lock().await.clone();
        let old = self
            .inner
            .players
            .lock()
            .await
            .insert(tag.to_owned(), Arc::clone(&new));

        let Some(old) = old else {
            debug!("seeded player {}", tag);
            return;
        };

        let changes = player_changes(&old, &new);
        if !changes.is_empty() {
            self.emit(PollingEvent::PlayerUpdate {
                old: Arc::clone(&old),
                new: Arc::clone(&new),
                changes,
            });
        }

        self.evaluate(&subscriptions, &old, &new, |name, old, new| {
            PollingEvent::Player { name, old, new }
        });
    }

    /// Polls the wars of every tracked clan once.
    pub async fn run_war_cycle(&self) {
        self.emit(PollingEvent::WarLoopStart);

        for tag in self.war_tags().await {
            match self.inner.fetcher.wars(&tag).await {
                Ok(wars) => {
                    self.forget_missing_slots(&tag, &wars).await;
                    for (slot, war) in wars {
                        self.handle_war(&tag, slot, war).await;
                    }
                }
                Err(e) => self.emit_debug(&e),
            }
        }

        self.emit(PollingEvent::WarLoopEnd);
    }

    /// Drops the snapshots of the slots a clan no longer has a war in.
    async fn forget_missing_slots(&self, clan_tag: &str, wars: &[(WarSlot, ClanWar)]) {
        let mut cached = self.inner.wars.lock().await;
        for slot in [WarSlot::Current, WarSlot::Preparation] {
            if wars.iter().all(|(s, _)| *s != slot) && cached.remove(&slot.key(clan_tag)).is_some() {
                debug!("forgot war {}", slot.key(clan_tag));
            }
        }
    }

    async fn handle_war(&self, clan_tag: &str, slot: WarSlot, war: ClanWar) {
        let key = slot.key(clan_tag);
        let new = Arc::new(war);
        let subscriptions = self.inner.war_events.lock().await.clone();
        let old = self
            .inner
            .wars
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&new));

        let Some(old) = old else {
            debug!("seeded war {}", key);
            return;
        };

        let round_changed = old.war_tag.is_some() && old.war_tag != new.war_tag;

        // Each preparation day holds the next round, never the same war
        if slot == WarSlot::Preparation && old.war_tag != new.war_tag {
            debug!("reseeded war {} with round {:?}", key, new.war_tag);
            return;
        }

        self.compare_wars(&key, &old, &new, &subscriptions);

        if slot == WarSlot::Current && round_changed {
            self.handle_round_transition(clan_tag, &key, &old, &subscriptions)
                .await;
        }
    }

    /// The current round moved on between two polls: also compares the
    /// cached war with its concluded state.
    async fn handle_round_transition(
        &self,
        clan_tag: &str,
        key: &str,
        old: &Arc<ClanWar>,
        subscriptions: &[Subscription<ClanWar>],
    ) {
        info!("war {} moved on from round {:?}", key, old.war_tag);

        match self
            .inner
            .fetcher
            .league_war(clan_tag, LeagueRound::Previous)
            .await
        {
            Ok(Some(concluded)) if concluded.war_tag == old.war_tag => {
                self.compare_wars(key, old, &Arc::new(concluded), subscriptions);
            }
            Ok(_) => debug!("previous round of {} is not {:?}", key, old.war_tag),
            Err(e) => self.emit_debug(&e),
        }
    }

    fn compare_wars(
        &self,
        key: &str,
        old: &Arc<ClanWar>,
        new: &Arc<ClanWar>,
        subscriptions: &[Subscription<ClanWar>],
    ) {
        let changes = war_changes(old, new);
        if !changes.is_empty() {
            self.emit(PollingEvent::WarUpdate {
                key: key.to_owned(),
                old: Arc::clone(old),
                new: Arc::clone(new),
                changes,
            });
        }

        self.evaluate(subscriptions, old, new, |name, old, new| PollingEvent::War {
            name,
            key: key.to_owned(),
            old,
            new,
        });
    }

    /// Probes the API once if maintenance tracking is enabled.
    pub async fn run_maintenance_cycle(&self) {
        if !self.inner.maintenance_tracking.load(Ordering::SeqCst) {
            return;
        }

        let outcome = self.inner.fetcher.probe().await;
        let transition = self
            .inner
            .maintenance
            .lock()
            .await
            .observe(&outcome, Instant::now());

        match transition {
            Some(MaintenanceTransition::Started) => self.emit(PollingEvent::MaintenanceStart),
            Some(MaintenanceTransition::Ended(duration)) => {
                self.emit(PollingEvent::MaintenanceEnd { duration })
            }
            None => {}
        }
    }

    /// Runs every predicate against `(old, new)` in registration order.
    ///
    /// A failing predicate publishes [`PollingEvent::Error`] and the next
    /// predicates still run.
    fn evaluate<T>(
        &self,
        subscriptions: &[Subscription<T>],
        old: &Arc<T>,
        new: &Arc<T>,
        event: impl Fn(String, Arc<T>, Arc<T>) -> PollingEvent,
    ) {
        for subscription in subscriptions {
            match (subscription.filter)(old.as_ref(), new.as_ref()) {
                Ok(true) => self.emit(event(
                    subscription.name.clone(),
                    Arc::clone(old),
                    Arc::clone(new),
                )),
                Ok(false) => {}
                Err(e) => {
                    warn!("predicate {} failed: {:#}", subscription.name, e);
                    let error = e.context(format!("predicate {} failed", subscription.name));
                    self.emit(PollingEvent::Error(Arc::new(error)));
                }
            }
        }
    }
}

/// Normalizes and appends tags, keeping the first insertion order.
async fn add_tags<I, S>(set: &Mutex<IndexSet<String>>, tags: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = set.lock().await;
    for tag in tags {
        set.insert(normalize_tag(tag.as_ref()));
    }
}

/// Removes tags, returning the normalized tags that were tracked.
async fn remove_tags<I, S>(set: &Mutex<IndexSet<String>>, tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = set.lock().await;
    tags.into_iter()
        .map(|tag| normalize_tag(tag.as_ref()))
        .filter(|tag| set.shift_remove(tag))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::{ClanMember, ErrorKind, MockFetcher, WarClan, WarState};
    use mockall::predicate::eq;
    use std::collections::VecDeque;

    fn member(tag: &str) -> ClanMember {
        ClanMember {
            tag: tag.to_string(),
            name: tag.to_string(),
            role: "member".to_string(),
            exp_level: 100,
            trophies: 3000,
            clan_rank: 1,
            donations: 0,
            donations_received: 0,
        }
    }

    fn clan(members: &[&str]) -> Clan {
        Clan {
            tag: "#ABC".to_string(),
            name: "clan".to_string(),
            description: None,
            clan_type: "open".to_string(),
            clan_level: 10,
            clan_points: 30000,
            required_trophies: 1000,
            war_frequency: None,
            war_win_streak: 0,
            war_wins: 100,
            is_war_log_public: true,
            members: members.len() as u32,
            member_list: members.iter().map(|tag| member(tag)).collect(),
        }
    }

    fn player(trophies: u32) -> Player {
        Player {
            tag: "#P1".to_string(),
            name: "Alice".to_string(),
            exp_level: 200,
            town_hall_level: 15,
            trophies,
            best_trophies: 5200,
            war_stars: 1000,
            attack_wins: 10,
            defense_wins: 2,
            donations: 100,
            donations_received: 50,
            role: None,
            clan: None,
        }
    }

    fn league_war(war_tag: &str, state: WarState, stars: u32) -> ClanWar {
        ClanWar {
            state,
            team_size: 15,
            preparation_start_time: None,
            start_time: None,
            end_time: None,
            clan: WarClan {
                tag: Some("#ABC".to_string()),
                stars,
                ..Default::default()
            },
            opponent: WarClan {
                tag: Some("#DEF".to_string()),
                ..Default::default()
            },
            war_tag: Some(war_tag.to_string()),
        }
    }

    fn not_found(path: &str) -> RequestError {
        RequestError::new(ErrorKind::NotFound, 404, "GET", path).with_message("not found")
    }

    fn engine(fetcher: MockFetcher) -> PollingEngine<MockFetcher> {
        let settings = PollingSettings {
            season: false,
            ..Default::default()
        };
        PollingEngine::new(fetcher, settings)
    }

    fn drain(receiver: &mut broadcast::Receiver<PollingEvent>) -> Vec<PollingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[PollingEvent]) -> Vec<String> {
        events.iter().map(|e| e.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_tags_are_normalized_and_ordered() {
        let engine = engine(MockFetcher::new());
        engine.add_clans(["#abc", "2pp", "#ABC"]).await;
        engine.add_players(vec!["#p1".to_string()]).await;

        assert_eq!(engine.clan_tags().await, vec!["#ABC", "#2PP"]);
        assert_eq!(engine.player_tags().await, vec!["#P1"]);

        engine.remove_clans(["abc"]).await;
        assert_eq!(engine.clan_tags().await, vec!["#2PP"]);
    }

    #[tokio::test]
    async fn test_member_changes_end_to_end() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![clan(&["#X", "#Y"]), clan(&["#X", "#Z"])]);
        fetcher
            .expect_clan()
            .with(eq("#ABC"))
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));

        let engine = engine(fetcher);
        engine.add_clans(["#ABC"]).await;
        let mut receiver = engine.subscribe();

        // First observation only seeds the store
        engine.run_clan_cycle().await;
        assert_eq!(names(&drain(&mut receiver)), vec!["clanLoopStart", "clanLoopEnd"]);

        engine.run_clan_cycle().await;
        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec!["clanLoopStart", "clanMemberAdd", "clanMemberRemove", "clanLoopEnd"]
        );
        assert!(matches!(&events[1], PollingEvent::ClanMemberAdd { member, .. } if member.tag == "#Z"));
        assert!(matches!(&events[2], PollingEvent::ClanMemberRemove { member, .. } if member.tag == "#Y"));

        let cached = engine.cached_clan("#ABC").await.unwrap();
        let tags: Vec<_> = cached.member_list.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, vec!["#X", "#Z"]);
    }

    #[tokio::test]
    async fn test_predicates_fire_from_second_observation() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![player(5000), player(5100), player(5100)]);
        fetcher
            .expect_player()
            .times(3)
            .returning(move |_| Ok(responses.pop_front().unwrap()));

        let engine = engine(fetcher);
        engine.add_players(["#P1"]).await;
        engine
            .set_player_event("trophiesUp", |old, new| Ok(new.trophies > old.trophies))
            .await;
        engine.set_player_event("always", |_, _| Ok(true)).await;
        let mut receiver = engine.subscribe();

        engine.run_player_cycle().await;
        assert_eq!(names(&drain(&mut receiver)), vec!["playerLoopStart", "playerLoopEnd"]);

        engine.run_player_cycle().await;
        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec!["playerLoopStart", "playerUpdate", "trophiesUp", "always", "playerLoopEnd"]
        );
        assert!(matches!(
            &events[2],
            PollingEvent::Player { old, new, .. } if old.trophies == 5000 && new.trophies == 5100
        ));

        // Snapshot was replaced, nothing changed since
        engine.run_player_cycle().await;
        assert_eq!(
            names(&drain(&mut receiver)),
            vec!["playerLoopStart", "always", "playerLoopEnd"]
        );
    }

    #[tokio::test]
    async fn test_failing_predicate_does_not_stop_the_others() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_clan().times(2).returning(|_| Ok(clan(&["#X"])));

        let engine = engine(fetcher);
        engine.add_clans(["#ABC"]).await;
        engine
            .set_clan_event("broken", |_, _| Err(anyhow::anyhow!("boom")))
            .await;
        engine.set_clan_event("working", |_, _| Ok(true)).await;
        let mut receiver = engine.subscribe();

        engine.run_clan_cycle().await;
        engine.run_clan_cycle().await;

        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec![
                "clanLoopStart",
                "clanLoopEnd",
                "clanLoopStart",
                "error",
                "working",
                "clanLoopEnd"
            ]
        );
        assert!(events[3].to_string().contains("predicate broken failed"));
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_only_that_tag() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_clan()
            .with(eq("#BAD"))
            .returning(|_| Err(not_found("/clans/%23BAD")));
        fetcher
            .expect_clan()
            .with(eq("#ABC"))
            .times(1)
            .returning(|_| Ok(clan(&["#X"])));

        let engine = engine(fetcher);
        engine.add_clans(["#BAD", "#ABC"]).await;
        let mut receiver = engine.subscribe();

        engine.run_clan_cycle().await;

        let events = drain(&mut receiver);
        assert_eq!(names(&events), vec!["clanLoopStart", "debug", "clanLoopEnd"]);
        assert!(matches!(
            &events[1],
            PollingEvent::Debug { path, status: 404, .. } if path == "/clans/%23BAD"
        ));
        assert!(engine.cached_clan("#ABC").await.is_some());
    }

    #[tokio::test]
    async fn test_removed_clan_is_seeded_again() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![clan(&["#X"]), clan(&["#Y"])]);
        fetcher
            .expect_clan()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));

        let engine = engine(fetcher);
        engine.add_clans(["#ABC"]).await;
        engine.run_clan_cycle().await;

        engine.remove_clans(["#ABC"]).await;
        assert!(engine.cached_clan("#ABC").await.is_none());

        engine.add_clans(["#ABC"]).await;
        let mut receiver = engine.subscribe();
        engine.run_clan_cycle().await;
        assert_eq!(names(&drain(&mut receiver)), vec!["clanLoopStart", "clanLoopEnd"]);
    }

    #[tokio::test]
    async fn test_round_transition_compares_concluded_round() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 10))],
            vec![(WarSlot::Current, league_war("#B", WarState::InWar, 0))],
        ]);
        fetcher
            .expect_wars()
            .with(eq("#ABC"))
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));
        fetcher
            .expect_league_war()
            .with(eq("#ABC"), eq(LeagueRound::Previous))
            .times(1)
            .returning(|_, _| Ok(Some(league_war("#A", WarState::WarEnded, 25))));

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;
        engine
            .set_war_event("warEnded", |old, new| {
                Ok(old.state != WarState::WarEnded && new.state == WarState::WarEnded)
            })
            .await;
        let mut receiver = engine.subscribe();

        engine.run_war_cycle().await;
        engine.run_war_cycle().await;

        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec![
                "warLoopStart",
                "warLoopEnd",
                "warLoopStart",
                "warUpdate",
                "warUpdate",
                "warEnded",
                "warLoopEnd"
            ]
        );
        // The round change itself comes first, then the concluded round
        assert!(matches!(
            &events[3],
            PollingEvent::WarUpdate { new, .. } if new.war_tag.as_deref() == Some("#B")
        ));
        assert!(matches!(
            &events[5],
            PollingEvent::War { key, old, new, .. }
                if key == "#ABC:1" && old.clan.stars == 10 && new.clan.stars == 25
        ));

        let cached = engine.cached_war("#ABC", WarSlot::Current).await.unwrap();
        assert_eq!(cached.war_tag.as_deref(), Some("#B"));
    }

    #[tokio::test]
    async fn test_round_transition_ignores_unrelated_previous_round() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 10))],
            vec![(WarSlot::Current, league_war("#B", WarState::InWar, 0))],
        ]);
        fetcher
            .expect_wars()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));
        fetcher
            .expect_league_war()
            .times(1)
            .returning(|_, _| Ok(Some(league_war("#Z", WarState::WarEnded, 30))));

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;
        engine.set_war_event("any", |_, _| Ok(true)).await;
        let mut receiver = engine.subscribe();

        engine.run_war_cycle().await;
        engine.run_war_cycle().await;

        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec!["warLoopStart", "warLoopEnd", "warLoopStart", "warUpdate", "any", "warLoopEnd"]
        );
        assert!(matches!(
            &events[4],
            PollingEvent::War { old, new, .. }
                if old.war_tag.as_deref() == Some("#A") && new.war_tag.as_deref() == Some("#B")
        ));
    }

    #[tokio::test]
    async fn test_last_round_ending_is_still_compared() {
        let not_in_war = ClanWar {
            state: WarState::NotInWar,
            team_size: 0,
            preparation_start_time: None,
            start_time: None,
            end_time: None,
            clan: WarClan::default(),
            opponent: WarClan::default(),
            war_tag: None,
        };
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 10))],
            vec![(WarSlot::Current, not_in_war)],
        ]);
        fetcher
            .expect_wars()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));
        fetcher
            .expect_league_war()
            .times(1)
            .returning(|_, _| Ok(None));

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;
        engine
            .set_war_event("leftWar", |old, new| {
                Ok(old.state == WarState::InWar && new.state == WarState::NotInWar)
            })
            .await;
        let mut receiver = engine.subscribe();

        engine.run_war_cycle().await;
        engine.run_war_cycle().await;

        assert_eq!(
            names(&drain(&mut receiver)),
            vec!["warLoopStart", "warLoopEnd", "warLoopStart", "warUpdate", "leftWar", "warLoopEnd"]
        );
    }

    #[tokio::test]
    async fn test_next_preparation_round_is_seeded_not_compared() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![
                (WarSlot::Current, league_war("#W2", WarState::InWar, 10)),
                (WarSlot::Preparation, league_war("#W3", WarState::Preparation, 0)),
            ],
            vec![
                (WarSlot::Current, league_war("#W2", WarState::InWar, 10)),
                (WarSlot::Preparation, league_war("#W4", WarState::Preparation, 0)),
            ],
        ]);
        fetcher
            .expect_wars()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));
        fetcher.expect_league_war().times(0);

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;
        engine.set_war_event("any", |_, _| Ok(true)).await;
        let mut receiver = engine.subscribe();

        engine.run_war_cycle().await;
        engine.run_war_cycle().await;

        // Only the unchanged current war reaches the predicate
        let events = drain(&mut receiver);
        assert_eq!(
            names(&events),
            vec!["warLoopStart", "warLoopEnd", "warLoopStart", "any", "warLoopEnd"]
        );
        assert!(matches!(&events[3], PollingEvent::War { key, .. } if key == "#ABC:1"));

        let cached = engine.cached_war("#ABC", WarSlot::Preparation).await.unwrap();
        assert_eq!(cached.war_tag.as_deref(), Some("#W4"));
    }

    #[tokio::test]
    async fn test_same_round_does_not_fetch_previous_round() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 10))],
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 13))],
        ]);
        fetcher
            .expect_wars()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));
        fetcher.expect_league_war().times(0);

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;
        engine
            .set_war_event("starsUp", |old, new| Ok(new.clan.stars > old.clan.stars))
            .await;
        let mut receiver = engine.subscribe();

        engine.run_war_cycle().await;
        engine.run_war_cycle().await;

        assert_eq!(
            names(&drain(&mut receiver)),
            vec!["warLoopStart", "warLoopEnd", "warLoopStart", "warUpdate", "starsUp", "warLoopEnd"]
        );
    }

    #[tokio::test]
    async fn test_war_slots_are_kept_apart() {
        let mut fetcher = MockFetcher::new();
        let mut responses = VecDeque::from(vec![
            vec![
                (WarSlot::Current, league_war("#A", WarState::InWar, 10)),
                (WarSlot::Preparation, league_war("#B", WarState::Preparation, 0)),
            ],
            vec![(WarSlot::Current, league_war("#A", WarState::InWar, 10))],
        ]);
        fetcher
            .expect_wars()
            .times(2)
            .returning(move |_| Ok(responses.pop_front().unwrap()));

        let engine = engine(fetcher);
        engine.add_wars(["#ABC"]).await;

        engine.run_war_cycle().await;
        assert!(engine.cached_war("#ABC", WarSlot::Preparation).await.is_some());

        engine.run_war_cycle().await;
        assert!(engine.cached_war("#ABC", WarSlot::Current).await.is_some());
        assert!(engine.cached_war("#ABC", WarSlot::Preparation).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_events() {
        let mut fetcher = MockFetcher::new();
        let mut outcomes = VecDeque::from(vec![
            Err(RequestError::new(ErrorKind::Http, 503, "GET", "/locations?limit=1")),
            Err(RequestError::new(ErrorKind::Http, 503, "GET", "/locations?limit=1")),
            Ok(()),
        ]);
        fetcher
            .expect_probe()
            .times(3)
            .returning(move || outcomes.pop_front().unwrap());

        let engine = engine(fetcher);
        let mut receiver = engine.subscribe();

        // Disabled tracking issues no probe
        engine.run_maintenance_cycle().await;
        assert!(drain(&mut receiver).is_empty());

        engine.set_maintenance_tracking(true);
        engine.run_maintenance_cycle().await;
        assert_eq!(names(&drain(&mut receiver)), vec!["maintenanceStart"]);

        tokio::time::advance(Duration::from_secs(30)).await;
        engine.run_maintenance_cycle().await;
        assert!(drain(&mut receiver).is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        engine.run_maintenance_cycle().await;
        let events = drain(&mut receiver);
        assert_eq!(names(&events), vec!["maintenanceEnd"]);
        assert!(matches!(
            events[0],
            PollingEvent::MaintenanceEnd { duration } if duration == Duration::from_secs(60)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_loops() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_clan().returning(|_| Ok(clan(&["#X"])));

        let engine = engine(fetcher);
        engine.add_clans(["#ABC"]).await;
        let mut receiver = engine.subscribe();

        engine.start().await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        engine.stop().await;

        let clan_loops = drain(&mut receiver)
            .iter()
            .filter(|e| matches!(e, PollingEvent::ClanLoopStart))
            .count();
        assert_eq!(clan_loops, 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(drain(&mut receiver)
            .iter()
            .all(|e| !matches!(e, PollingEvent::ClanLoopStart)));
    }
}
