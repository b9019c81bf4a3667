//! Cron-driven auto-sync.
//!
//! [`AutoSyncService`] wraps a `JobScheduler` and registers one job that
//! reconciles every store with `auto_sync` enabled. Scheduled runs reuse the
//! coordinator's overlap guards, so a tick that fires while a store is still
//! syncing skips that store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{validate_cron_expression, SchedulerConfig};
use crate::coordinator::SyncCoordinator;
use crate::SchedulerError;

/// Lifecycle wrapper around `JobScheduler` for scheduled syncs.
pub struct AutoSyncService {
    scheduler: JobScheduler,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    is_running: AtomicBool,
}

impl AutoSyncService {
    pub async fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        validate_cron_expression(&config.sync_cron)?;
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            config,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            is_running: AtomicBool::new(false),
        })
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        if let Err(e) = self.scheduler.start().await {
            self.is_running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!(
            cron = %self.config.sync_cron,
            timezone = %self.config.timezone.name(),
            "Auto-sync scheduler started"
        );
        Ok(())
    }

    /// Stop scheduling and wait up to `shutdown_timeout` for in-flight runs.
    ///
    /// In-flight runs see the cancellation between batches; a commit that
    /// has started always completes.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        info!("Initiating auto-sync shutdown");

        self.shutdown_token.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "In-flight syncs did not finish before the shutdown timeout"
            );
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Error during scheduler shutdown: {}", e);
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Auto-sync shutdown complete");
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register the auto-sync job on the configured schedule.
    pub async fn register_sync_job(
        &self,
        coordinator: Arc<SyncCoordinator>,
    ) -> Result<uuid::Uuid, SchedulerError> {
        let jitter = self.config.jitter.clone();
        self.add_cron_job("auto-sync", &self.config.sync_cron, move |cancel| {
            let coordinator = Arc::clone(&coordinator);
            let jitter = jitter.clone();
            async move {
                let delay = jitter.generate_jitter();
                if !delay.is_zero() {
                    debug!(jitter_ms = delay.as_millis(), "Applying jitter before sync");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                match coordinator.sync_auto(&cancel).await {
                    Ok(summary) if summary.has_failures() => warn!(
                        stores = summary.results.len(),
                        failures = summary.failures(),
                        "Scheduled sync finished with failures"
                    ),
                    Ok(summary) => info!(
                        stores = summary.results.len(),
                        skipped = summary.skipped(),
                        "Scheduled sync finished"
                    ),
                    Err(e) => error!(error = %e, "Scheduled sync could not list stores"),
                }
            }
        })
        .await
    }

    /// Register a timezone-aware cron job.
    ///
    /// The job receives the service's shutdown token and is tracked so
    /// [`shutdown`](Self::shutdown) can wait for it.
    pub async fn add_cron_job<F, Fut>(
        &self,
        name: &str,
        cron_expr: &str,
        job_fn: F,
    ) -> Result<uuid::Uuid, SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_cron_expression(cron_expr)?;

        let tz = self.config.timezone;
        let job_name = name.to_string();
        let shutdown_token = self.shutdown_token.clone();
        let tracker = self.tracker.clone();

        let job = Job::new_async_tz(cron_expr, tz, move |_uuid, _lock| {
            let name = job_name.clone();
            let token = shutdown_token.clone();
            let job_fn = job_fn.clone();
            let tracker = tracker.clone();

            Box::pin(async move {
                if token.is_cancelled() {
                    return;
                }
                info!(job = %name, "Job started");
                let start = std::time::Instant::now();

                tracker.track_future(job_fn(token)).await;

                info!(
                    job = %name,
                    duration_ms = start.elapsed().as_millis(),
                    "Job completed"
                );
            })
        })
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

        let uuid = self.scheduler.add(job).await?;
        info!(
            job = %name,
            uuid = %uuid,
            cron = %cron_expr,
            timezone = %tz.name(),
            "Job registered"
        );
        Ok(uuid)
    }
}
