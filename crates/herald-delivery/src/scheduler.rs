//! Retry scheduler: the polling worker that drains due deliveries.
//!
//! Each worker loops on a cancellable poll interval, atomically claims a
//! batch of deliveries whose retry time has passed, and feeds them through
//! the [`Dispatcher`]. Claiming moves a delivery to `processing` inside
//! one storage transaction, so concurrent workers never dispatch the same
//! delivery twice.

use std::{sync::Arc, time::Duration};

use herald_core::time::Clock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Pause after a failed sweep before polling again, to avoid tight error
/// loops when storage is down.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for the scheduler worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent scheduler workers.
    pub worker_count: usize,
    /// Maximum deliveries claimed per sweep.
    pub batch_size: usize,
    /// Pause between sweeps when nothing was due.
    pub poll_interval: Duration,
    /// Grace period granted to workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters aggregated across all scheduler workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Completed sweeps, empty ones included.
    pub sweeps: u64,
    /// Deliveries claimed from the due set.
    pub claimed: u64,
    /// Dispatch calls actually made.
    pub dispatched: u64,
    /// Dispatches acknowledged by the receiver.
    pub succeeded: u64,
    /// Dispatches that failed, retried or dead-lettered.
    pub failed: u64,
    /// Workers currently running.
    pub active_workers: usize,
}

/// One scheduler worker.
pub struct RetryScheduler {
    id: usize,
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a worker with the given id.
    pub fn new(
        id: usize,
        storage: Arc<dyn DeliveryStorage>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
        stats: Arc<RwLock<SchedulerStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, dispatcher, config, stats, cancellation_token, clock }
    }

    /// Runs the worker until cancellation.
    ///
    /// Sweeps back to back while work is available; sleeps one poll
    /// interval when a sweep comes up empty, and backs off briefly after
    /// a sweep error.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails; sweep errors are logged
    /// and retried.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "retry scheduler starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "retry scheduler received shutdown signal");
                break;
            }

            match self.sweep().await {
                Ok(processed) => {
                    if processed == 0 {
                        tokio::select! {
                            () = self.clock.sleep(self.config.poll_interval) => {}
                            () = self.cancellation_token.cancelled() => break,
                        }
                    }
                }
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "retry sweep failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = self.id, "retry scheduler stopped");
        Ok(())
    }

    /// Claims one batch of due deliveries and dispatches them in turn.
    ///
    /// Returns how many deliveries were claimed. Dispatch outcomes land in
    /// the shared stats; a shutdown signal mid-batch stops dispatching,
    /// and claimed-but-undispatched rows stay in `processing`, which
    /// `begin_attempt` accepts again on the next pass.
    ///
    /// # Errors
    ///
    /// Returns error if claiming from storage fails.
    pub async fn sweep(&self) -> Result<usize> {
        let due = self
            .storage
            .claim_due(self.clock.now_utc(), self.config.batch_size)
            .await
            .map_err(DeliveryError::from)?;
        let claimed = due.len();

        {
            let mut stats = self.stats.write().await;
            stats.sweeps += 1;
            stats.claimed += claimed as u64;
        }

        if claimed == 0 {
            debug!(worker_id = self.id, "no deliveries due");
            return Ok(0);
        }

        debug!(worker_id = self.id, claimed, "processing due deliveries");

        for delivery in &due {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let outcome = self.dispatcher.dispatch(delivery).await;

            let mut stats = self.stats.write().await;
            stats.dispatched += 1;
            if outcome.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }

        info!(worker_id = self.id, claimed, "retry sweep complete");
        Ok(claimed)
    }
}
