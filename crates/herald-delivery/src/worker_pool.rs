//! Lifecycle management for the scheduler workers.
//!
//! Spawns the configured number of [`RetryScheduler`] tasks, supervises
//! their handles, and shuts them down together: cancel the shared token,
//! then wait for every worker to finish inside a grace period. Dropping
//! the pool without a graceful shutdown still cancels the token so no
//! task is orphaned.

use std::{sync::Arc, time::Duration};

use herald_core::time::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    scheduler::{RetryScheduler, SchedulerConfig, SchedulerStats},
    storage::DeliveryStorage,
};

/// Pool of retry scheduler workers sharing one dispatcher and one
/// cancellation token.
pub struct SchedulerPool {
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerPool {
    /// Creates an idle pool; call [`spawn_workers`] to start it.
    ///
    /// [`spawn_workers`]: SchedulerPool::spawn_workers
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            config,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Shared stats handle, readable while workers run.
    pub fn stats(&self) -> Arc<RwLock<SchedulerStats>> {
        self.stats.clone()
    }

    /// Token that stops the workers when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns all configured workers and returns immediately.
    ///
    /// Workers run until the cancellation token fires.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning retry scheduler workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = RetryScheduler::new(
                worker_id,
                self.storage.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "scheduler worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all scheduler workers spawned");
    }

    /// Cancels the workers and waits for them to finish.
    ///
    /// In-flight dispatches complete; idle workers wake from their poll
    /// sleep immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WorkerPanic` if a worker task panicked, or
    /// `DeliveryError::ShutdownTimeout` if the grace period elapsed with
    /// workers still running.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating scheduler shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let join_all = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(
                                worker_id,
                                error = %error,
                                "worker finished with error during shutdown"
                            );
                        }
                    }
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            message: join_error.to_string(),
                        });
                    }
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(Some(panic)) => Err(panic),
            Ok(None) => {
                info!("scheduler pool shutdown complete");
                Ok(())
            }
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "scheduler shutdown timed out, workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            }
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "scheduler pool dropped without graceful shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
