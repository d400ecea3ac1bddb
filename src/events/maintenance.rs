//! Detection of the provider maintenance breaks.

use log::{info, warn};
use tokio::time::{Duration, Instant};

use crate::rest::RequestError;

/// Status the API answers during a maintenance break.
pub const SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    Normal,
    /// In maintenance since the given instant
    InMaintenance(Instant),
}

/// Transition observed by [`MaintenanceDetector::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTransition {
    Started,
    Ended(Duration),
}

/// Two-state machine fed with the outcome of each probe.
#[derive(Debug)]
pub struct MaintenanceDetector {
    state: MaintenanceState,
}

impl MaintenanceDetector {
    pub fn new() -> Self {
        MaintenanceDetector {
            state: MaintenanceState::Normal,
        }
    }

    pub fn state(&self) -> MaintenanceState {
        self.state
    }

    /// Feeds a probe outcome observed at `now`.
    ///
    /// A `503` enters maintenance, the next success leaves it. Other failures
    /// say nothing about maintenance and leave the state untouched.
    pub fn observe(
        &mut self,
        outcome: &Result<(), RequestError>,
        now: Instant,
    ) -> Option<MaintenanceTransition> {
        match (self.state, outcome) {
            (MaintenanceState::Normal, Err(e)) if e.status == SERVICE_UNAVAILABLE => {
                warn!("maintenance break started");
                self.state = MaintenanceState::InMaintenance(now);
                Some(MaintenanceTransition::Started)
            }
            (MaintenanceState::InMaintenance(since), Ok(())) => {
                let duration = now.saturating_duration_since(since);
                info!("maintenance break ended after {:?}", duration);
                self.state = MaintenanceState::Normal;
                Some(MaintenanceTransition::Ended(duration))
            }
            _ => None,
        }
    }
}

impl Default for MaintenanceDetector {
    fn default() -> Self {
        Self::new()
    }
}
