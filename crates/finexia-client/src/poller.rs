use crate::api::{ApiError, StatusApi};
use crate::channel::StatusChannel;
use crate::sync::StatusSynchronizer;
use crate::timer::TimerHandle;
use finexia_core::wire::SystemStatusResponse;
use futures_util::future::BoxFuture;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct PollCounters {
    completed_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    skipped_ticks: AtomicU64,
    suppressed_ticks: AtomicU64,
}

/// Periodic full-status fetch feeding the synchronizer. At most one fetch is
/// in flight; a tick that comes due meanwhile is skipped, not queued.
pub struct PollingCoordinator<A> {
    api: Arc<A>,
    sync: Arc<StatusSynchronizer>,
    suppress_with: Option<StatusChannel>,
    counters: Arc<PollCounters>,
    task: Mutex<Option<TimerHandle>>,
}

impl<A> PollingCoordinator<A>
where
    A: StatusApi + 'static,
{
    pub fn new(api: Arc<A>, sync: Arc<StatusSynchronizer>) -> Self {
        Self {
            api,
            sync,
            suppress_with: None,
            counters: Arc::new(PollCounters::default()),
            task: Mutex::new(None),
        }
    }

    /// Opt-in: skip ticks while `channel` reports an open connection.
    pub fn suppress_while_connected(mut self, channel: StatusChannel) -> Self {
        self.suppress_with = Some(channel);
        self
    }

    /// Starts polling, replacing any previous loop. The first fetch is
    /// issued immediately. Must be called inside a tokio runtime.
    pub fn start(&self, every: Duration) {
        let api = self.api.clone();
        let sync = self.sync.clone();
        let channel = self.suppress_with.clone();
        let counters = self.counters.clone();
        let every = every.max(Duration::from_millis(1));
        let handle = TimerHandle::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<BoxFuture<'static, Result<SystemStatusResponse, ApiError>>> =
                None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if in_flight.is_some() {
                            counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                            debug!(event = "poll_tick_skipped");
                            continue;
                        }
                        if channel.as_ref().is_some_and(StatusChannel::is_connected) {
                            counters.suppressed_ticks.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        let api = api.clone();
                        in_flight = Some(Box::pin(async move { api.fetch_status().await }));
                    }
                    result = async {
                        match in_flight.as_mut() {
                            Some(fetch) => fetch.await,
                            None => std::future::pending().await,
                        }
                    }, if in_flight.is_some() => {
                        in_flight = None;
                        match result {
                            Ok(response) => {
                                sync.apply_status_response(response);
                                counters.completed_fetches.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                warn!(event = "poll_fetch_error", error = %err);
                                sync.record_error(err.to_string());
                                counters.failed_fetches.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.lock_task().replace(handle) {
            previous.cancel();
        }
        info!(event = "poll_started", interval_ms = every.as_millis() as u64);
    }

    /// Stops polling and drops any in-flight fetch. Safe when not started.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.cancel();
            info!(event = "poll_stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn completed_fetches(&self) -> u64 {
        self.counters.completed_fetches.load(Ordering::Relaxed)
    }

    pub fn failed_fetches(&self) -> u64 {
        self.counters.failed_fetches.load(Ordering::Relaxed)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.counters.skipped_ticks.load(Ordering::Relaxed)
    }

    pub fn suppressed_ticks(&self) -> u64 {
        self.counters.suppressed_ticks.load(Ordering::Relaxed)
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<TimerHandle>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
