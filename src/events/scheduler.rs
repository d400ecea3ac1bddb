//! Background tasks with an explicit start and stop.

use std::future::Future;

use log::debug;
use tokio::{
    task::JoinHandle,
    time::{self, Duration},
};

/// A spawned task that runs until stopped or dropped.
///
/// # Examples
///
/// ```no_run
/// use clanwatch::events::RepeatingTask;
/// use std::time::Duration;
///
/// # async fn example() {
/// let task = RepeatingTask::spawn("heartbeat", Duration::from_secs(10), || async {
///     println!("tick");
/// });
/// task.stop();
/// # }
/// ```
pub struct RepeatingTask {
    name: String,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Runs `job`, sleeps `period`, and starts over.
    ///
    /// The period is counted from the end of a run, so runs never overlap
    /// and a slow run delays the next one.
    pub fn spawn<F, Fut>(name: &str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("starting task {} every {:?}", name, period);
        let handle = tokio::spawn(async move {
            loop {
                job().await;
                time::sleep(period).await;
            }
        });

        RepeatingTask {
            name: name.to_owned(),
            handle,
        }
    }

    /// Wraps a future that schedules itself.
    pub fn spawn_future<Fut>(name: &str, future: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("starting task {}", name);
        RepeatingTask {
            name: name.to_owned(),
            handle: tokio::spawn(future),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Aborts the task.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        debug!("stopping task {}", self.name);
        self.handle.abort();
    }
}
