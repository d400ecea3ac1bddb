//! Long running watcher wiring the configuration to the polling engine.
//!
//! The [`Watcher`] builds the request pipeline, logs into the developer
//! portal when an account is configured, tracks the configured tags and logs
//! every event until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use log::{Level, info, log, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    config::Config,
    events::{PollingEngine, PollingEvent},
    rest::{KeyManager, RequestExecutor, RestClient},
};

pub struct Watcher {
    engine: PollingEngine<RestClient>,
}

impl Watcher {
    /// Creates a new Watcher from the configuration.
    ///
    /// # Errors
    ///
    /// Fails if an account is configured and no key could be provisioned.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let rest = &config.rest;
        let keys = Arc::new(KeyManager::new(&rest.base_url, rest.keys.clone()));

        let mut executor = RequestExecutor::new(&rest.base_url, keys)
            .with_retry_limit(rest.retry_limit)
            .with_timeout(rest.timeout());
        if let Some(throttler) = rest.build_throttler() {
            executor = executor.with_throttler(throttler);
        }
        if rest.cache {
            executor = executor.with_cache(rest.cache_sweep_interval());
        }

        let client = RestClient::new(executor);
        if let Some(account) = config.account {
            let email = account.email.clone();
            client
                .login(account)
                .await
                .with_context(|| format!("failed to provision keys for {}", email))?;
        }

        let polling = &config.polling;
        let engine = PollingEngine::new(client, polling.settings());
        engine.add_clans(&polling.clans).await;
        engine.add_players(&polling.players).await;
        engine.add_wars(&polling.wars).await;
        engine.set_maintenance_tracking(polling.maintenance);

        info!(
            "tracking {} clans, {} players and the wars of {} clans",
            polling.clans.len(),
            polling.players.len(),
            polling.wars.len()
        );

        Ok(Watcher { engine })
    }

    pub fn engine(&self) -> &PollingEngine<RestClient> {
        &self.engine
    }

    /// Starts polling and logs events until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut events = self.engine.subscribe();
        self.engine.start().await;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => log!(level(&event), "{}", event),
                    Err(RecvError::Lagged(skipped)) => warn!("skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                },
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for ctrl-c")?;
                    info!("received ctrl-c, shutting down");
                    break;
                }
            }
        }

        self.engine.stop().await;
        Ok(())
    }
}

/// Log level of an event.
fn level(event: &PollingEvent) -> Level {
    match event {
        PollingEvent::Error(_) => Level::Error,
        PollingEvent::MaintenanceStart => Level::Warn,
        PollingEvent::Debug { .. } => Level::Debug,
        PollingEvent::ClanLoopStart
        | PollingEvent::ClanLoopEnd
        | PollingEvent::PlayerLoopStart
        | PollingEvent::PlayerLoopEnd
        | PollingEvent::WarLoopStart
        | PollingEvent::WarLoopEnd => Level::Debug,
        _ => Level::Info,
    }
}
