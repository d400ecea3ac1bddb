//! Typed endpoints of the REST API.
//!
//! This module provides the [`RestClient`], a thin layer over the
//! [`RequestExecutor`] that builds the paths and decodes the snapshots, and the
//! [`Fetcher`] trait through which the polling engine reads the API.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use mockall::automock;
use serde_json::Value;

use crate::{
    rest::{
        error::{ErrorKind, ProvisionError, RequestError},
        executor::{RequestExecutor, RequestOptions, Response},
        keys::Account,
        portal::{DeveloperPortal, PortalClient},
        structs::{Clan, ClanWar, ClanWarLeagueGroup, LeagueRound, Player, WarSlot, WarState},
    },
    utils::{encode_tag, normalize_tag},
};

/// Read access to the API used by the polling engine.
///
/// This trait abstracts the HTTP operations for easier testing with mocks.
#[automock]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches a clan by tag.
    async fn clan(&self, tag: &str) -> Result<Clan, RequestError>;
    /// Fetches a player by tag.
    async fn player(&self, tag: &str) -> Result<Player, RequestError>;
    /// Fetches the wars a clan is part of, at most one per [`WarSlot`].
    async fn wars(&self, clan_tag: &str) -> Result<Vec<(WarSlot, ClanWar)>, RequestError>;
    /// Fetches a league war of a clan relative to the round being fought.
    async fn league_war(
        &self,
        clan_tag: &str,
        round: LeagueRound,
    ) -> Result<Option<ClanWar>, RequestError>;
    /// Issues a cheap uncached call, used to observe maintenance breaks.
    async fn probe(&self) -> Result<(), RequestError>;
}

/// Client for the REST API.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::rest::{KeyManager, RequestExecutor, RequestOptions, RestClient};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let keys = Arc::new(KeyManager::new("https://api.clashofclans.com/v1", vec!["key".to_string()]));
/// let client = RestClient::new(RequestExecutor::new("https://api.clashofclans.com/v1", keys));
///
/// let clan = client.get_clan("#2PP", &RequestOptions::default()).await.unwrap();
/// println!("Clan: {}", clan.data);
/// # }
/// ```
pub struct RestClient {
    executor: RequestExecutor,
}

impl RestClient {
    pub fn new(executor: RequestExecutor) -> Self {
        RestClient { executor }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Logs into the developer portal and provisions the account keys.
    ///
    /// Once logged in, keys rejected later on are replaced automatically.
    ///
    /// # Returns
    ///
    /// The number of keys held after provisioning.
    ///
    /// # Errors
    ///
    /// Any [`ProvisionError`]; none is retried.
    pub async fn login(&self, account: Account) -> Result<usize, ProvisionError> {
        let portal = PortalClient::new(&account.portal_url, &account.ip_echo_url)?;
        self.login_with(account, Arc::new(portal)).await
    }

    /// Same as [`RestClient::login`] with a given portal implementation.
    pub async fn login_with(
        &self,
        account: Account,
        portal: Arc<dyn DeveloperPortal>,
    ) -> Result<usize, ProvisionError> {
        let keys = self.executor.keys();
        keys.set_account(account, portal);
        keys.provision().await?;

        info!("logged in with {} keys", keys.len());
        Ok(keys.len())
    }

    /// Request `/clans/{clanTag}`.
    pub async fn get_clan(
        &self,
        tag: &str,
        options: &RequestOptions,
    ) -> Result<Response<Clan>, RequestError> {
        let path = format!("/clans/{}", encode_tag(tag));
        self.executor.request(&path, options).await
    }

    /// Request `/players/{playerTag}`.
    pub async fn get_player(
        &self,
        tag: &str,
        options: &RequestOptions,
    ) -> Result<Response<Player>, RequestError> {
        let path = format!("/players/{}", encode_tag(tag));
        self.executor.request(&path, options).await
    }

    /// Request `/clans/{clanTag}/currentwar`, the regular war of a clan.
    ///
    /// During a league this answers `notInWar`, see [`RestClient::get_league_group`].
    pub async fn get_current_war(
        &self,
        clan_tag: &str,
        options: &RequestOptions,
    ) -> Result<Response<ClanWar>, RequestError> {
        let path = format!("/clans/{}/currentwar", encode_tag(clan_tag));
        self.executor.request(&path, options).await
    }

    /// Request `/clans/{clanTag}/currentwar/leaguegroup`.
    ///
    /// Answers `404` when the clan is not part of a league.
    pub async fn get_league_group(
        &self,
        clan_tag: &str,
        options: &RequestOptions,
    ) -> Result<Response<ClanWarLeagueGroup>, RequestError> {
        let path = format!("/clans/{}/currentwar/leaguegroup", encode_tag(clan_tag));
        self.executor.request(&path, options).await
    }

    /// Request `/clanwarleagues/wars/{warTag}`.
    ///
    /// The returned war carries `war_tag` even when the payload omits it.
    pub async fn get_league_war(
        &self,
        war_tag: &str,
        options: &RequestOptions,
    ) -> Result<Response<ClanWar>, RequestError> {
        let war_tag = normalize_tag(war_tag);
        let path = format!("/clanwarleagues/wars/{}", encode_tag(&war_tag));

        let mut response: Response<ClanWar> = self.executor.request(&path, options).await?;
        response.data.war_tag.get_or_insert(war_tag);
        Ok(response)
    }

    /// League group of a clan, `None` when the clan is not part of a league.
    async fn league_group(&self, clan_tag: &str) -> Result<Option<ClanWarLeagueGroup>, RequestError> {
        match self.get_league_group(clan_tag, &RequestOptions::default()).await {
            Ok(response) => Ok(Some(response.data)),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Finds the war of `clan_tag` among the wars of one league round.
    async fn clan_war_in_round(
        &self,
        clan_tag: &str,
        war_tags: &[String],
    ) -> Result<Option<ClanWar>, RequestError> {
        for war_tag in war_tags {
            let war = self
                .get_league_war(war_tag, &RequestOptions::default())
                .await?
                .data;
            if war.involves(clan_tag) {
                return Ok(Some(war.oriented_to(clan_tag)));
            }
        }

        debug!("clan {} not found in round {:?}", clan_tag, war_tags);
        Ok(None)
    }
}

#[async_trait]
impl Fetcher for RestClient {
    async fn clan(&self, tag: &str) -> Result<Clan, RequestError> {
        Ok(self.get_clan(tag, &RequestOptions::default()).await?.data)
    }

    async fn player(&self, tag: &str) -> Result<Player, RequestError> {
        Ok(self.get_player(tag, &RequestOptions::default()).await?.data)
    }

    /// A regular war is returned in the [`WarSlot::Current`] slot. During a
    /// league the two most recent scheduled rounds are looked up: the war in
    /// preparation goes to [`WarSlot::Preparation`], the other one to
    /// [`WarSlot::Current`].
    async fn wars(&self, clan_tag: &str) -> Result<Vec<(WarSlot, ClanWar)>, RequestError> {
        let tag = normalize_tag(clan_tag);

        let current = self
            .get_current_war(&tag, &RequestOptions::default())
            .await?
            .data;
        if current.state != WarState::NotInWar {
            return Ok(vec![(WarSlot::Current, current.oriented_to(&tag))]);
        }

        let Some(group) = self.league_group(&tag).await? else {
            return Ok(vec![(WarSlot::Current, current)]);
        };

        let mut wars: Vec<(WarSlot, ClanWar)> = Vec::new();
        for war_tags in group.scheduled_rounds().iter().take(2) {
            let Some(war) = self.clan_war_in_round(&tag, war_tags).await? else {
                continue;
            };

            let slot = match war.state {
                WarState::Preparation => WarSlot::Preparation,
                _ => WarSlot::Current,
            };
            if wars.iter().all(|(s, _)| *s != slot) {
                wars.push((slot, war));
            }
        }

        if wars.is_empty() {
            wars.push((WarSlot::Current, current));
        }
        wars.sort_by_key(|(slot, _)| slot.index());
        Ok(wars)
    }

    /// Rounds still in preparation are skipped: [`LeagueRound::Current`] is
    /// the latest round past preparation, [`LeagueRound::Previous`] the one
    /// before.
    async fn league_war(
        &self,
        clan_tag: &str,
        round: LeagueRound,
    ) -> Result<Option<ClanWar>, RequestError> {
        let tag = normalize_tag(clan_tag);
        let Some(group) = self.league_group(&tag).await? else {
            return Ok(None);
        };

        let mut to_skip = match round {
            LeagueRound::Current => 0,
            LeagueRound::Previous => 1,
        };
        for war_tags in group.scheduled_rounds() {
            let Some(war) = self.clan_war_in_round(&tag, &war_tags).await? else {
                continue;
            };
            if war.state == WarState::Preparation {
                continue;
            }
            if to_skip == 0 {
                return Ok(Some(war));
            }
            to_skip -= 1;
        }

        Ok(None)
    }

    async fn probe(&self) -> Result<(), RequestError> {
        let options = RequestOptions {
            force: true,
            cache: Some(false),
            ..Default::default()
        };
        self.executor
            .request::<Value>("/locations?limit=1", &options)
            .await
            .map(|_| ())
    }
}
