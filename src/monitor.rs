//! Background health checks for remote LDAP servers.

use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionPool;

/// A repeatable unit of background work.
pub type MonitorTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs tasks repeatedly with a fixed delay between the end of one run and
/// the start of the next.
pub trait Scheduler: Send + Sync {
    fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: MonitorTask,
    ) -> MonitorHandle;
}

/// Cancels a scheduled task. [`MonitorHandle::cancel`] waits until the task
/// has stopped.
pub struct MonitorHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            token,
            join: Some(join),
        }
    }

    /// A handle for a task that is not backed by a spawned tokio task.
    pub fn detached(token: CancellationToken) -> Self {
        Self { token, join: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!("Health monitor task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Schedules tasks on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: MonitorTask,
    ) -> MonitorHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let join = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = task() => {}
                }
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Scheduled task stopped");
        });

        MonitorHandle::new(token, join)
    }
}

/// Re-probes every pool so that failed servers come back into rotation.
pub struct HealthMonitor {
    pools: Vec<Arc<ConnectionPool>>,
}

impl HealthMonitor {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        Self { pools }
    }

    /// Probe all pools concurrently. Returns how many are healthy afterwards.
    pub async fn run_once(&self) -> usize {
        let results = join_all(self.pools.iter().map(|pool| pool.probe())).await;
        let healthy = results.into_iter().filter(|ok| *ok).count();
        debug!("Health check: {}/{} remote LDAP pools available", healthy, self.pools.len());
        healthy
    }

    pub fn start(self: Arc<Self>, scheduler: &dyn Scheduler, interval: Duration) -> MonitorHandle {
        let task: MonitorTask = Arc::new(move || {
            let monitor = Arc::clone(&self);
            Box::pin(async move {
                monitor.run_once().await;
            })
        });
        scheduler.schedule_with_fixed_delay(interval, interval, task)
    }
}
