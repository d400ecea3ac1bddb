//! Monthly season boundaries.
//!
//! A season ends on the last Monday of the month at 05:00 UTC and is named
//! after the month it ends in.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeDelta, Utc};
use log::{debug, error, info};
use tokio::{
    sync::broadcast,
    time::{self, Duration, Instant},
};

use crate::events::PollingEvent;

/// Hour (UTC) of the season reset.
pub const SEASON_RESET_HOUR: u32 = 5;

/// Longest single sleep armed by the season timer, about 24.8 days.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Interval between two checks while the boundary is further than [`MAX_TIMER_DELAY`].
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock starting at a fixed date and advancing with the tokio clock.
///
/// Under a paused tokio runtime it follows virtual time.
pub struct InstantClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl InstantClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        InstantClock {
            origin,
            started: Instant::now(),
        }
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::zero());
        self.origin + elapsed
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Season end of the given month.
fn season_end_in(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let (year, month) = next_month(year, month);
    let last_day = NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()?;
    let days_since_monday = u64::from(last_day.weekday().num_days_from_monday());
    let last_monday = last_day.checked_sub_days(Days::new(days_since_monday))?;

    Some(last_monday.and_hms_opt(SEASON_RESET_HOUR, 0, 0)?.and_utc())
}

/// First season boundary strictly after `now`.
pub fn next_season_start(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let this_month = season_end_in(now.year(), now.month())?;
    if this_month > now {
        return Some(this_month);
    }

    let (year, month) = next_month(now.year(), now.month());
    season_end_in(year, month)
}

/// Identifier `YYYY-MM` of the season running at `now`.
pub fn season_id(now: DateTime<Utc>) -> Option<String> {
    next_season_start(now).map(|end| end.format("%Y-%m").to_string())
}

/// What the season timer does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeasonWait {
    /// The boundary is too far away, check again after [`RECHECK_INTERVAL`]
    Recheck,
    /// Sleep `after` then announce `season_id`
    Fire { after: Duration, season_id: String },
}

/// Plans the next step of the season timer.
pub fn plan(now: DateTime<Utc>) -> Option<SeasonWait> {
    let next = next_season_start(now)?;
    let remaining = (next - now).to_std().unwrap_or(Duration::ZERO);

    if remaining > MAX_TIMER_DELAY {
        return Some(SeasonWait::Recheck);
    }

    Some(SeasonWait::Fire {
        after: remaining,
        season_id: season_id(next)?,
    })
}

/// Publishes [`PollingEvent::NewSeasonStart`] at every season boundary.
///
/// Runs until aborted.
pub async fn run_season_timer(clock: Arc<dyn Clock>, sender: broadcast::Sender<PollingEvent>) {
    loop {
        match plan(clock.now()) {
            Some(SeasonWait::Recheck) => {
                debug!("next season start is far away, checking again later");
                time::sleep(RECHECK_INTERVAL).await;
            }
            Some(SeasonWait::Fire { after, season_id }) => {
                debug!("season {} starts in {:?}", season_id, after);
                time::sleep(after).await;

                info!("new season {} started", season_id);
                let _ = sender.send(PollingEvent::NewSeasonStart { season_id });

                // Leave the boundary behind before planning the next one
                time::sleep(RECHECK_INTERVAL).await;
            }
            None => {
                error!("could not compute the next season start");
                return;
            }
        }
    }
}
