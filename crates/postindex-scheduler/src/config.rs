//! Scheduler configuration.
//!
//! [`SchedulerConfig`] is the validated form of the `[scheduler]` settings
//! section: the timezone is parsed, the cron expression checked and `0`
//! concurrency resolved to the machine's parallelism.

use std::time::Duration;

use chrono_tz::Tz;
use tokio_cron_scheduler::Job;

use postindex_types::SchedulerSettings;

use crate::jitter::JitterConfig;
use crate::SchedulerError;

/// Validated scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum stores reconciled in parallel
    pub concurrency: usize,
    /// Auto-sync cron expression (6 fields, seconds first)
    pub sync_cron: String,
    pub timezone: Tz,
    pub jitter: JitterConfig,
    /// Time in-flight runs get to finish after shutdown is signalled
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let settings = SchedulerSettings::default();
        Self {
            concurrency: settings.effective_concurrency(),
            sync_cron: settings.sync_cron,
            timezone: Tz::UTC,
            jitter: JitterConfig::new(settings.jitter_secs),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Result<Self, SchedulerError> {
        validate_cron_expression(&settings.sync_cron)?;
        Ok(Self {
            concurrency: settings.effective_concurrency(),
            sync_cron: settings.sync_cron.clone(),
            timezone: parse_timezone(&settings.timezone)?,
            jitter: JitterConfig::new(settings.jitter_secs),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an IANA timezone identifier.
pub fn parse_timezone(tz_str: &str) -> Result<Tz, SchedulerError> {
    tz_str
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(tz_str.to_string()))
}

/// Check that a cron expression parses.
///
/// Expressions use the 6-field format with seconds first.
///
/// # Example
///
/// ```
/// use postindex_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("0 */5 * * * *").is_ok());
/// assert!(validate_cron_expression("invalid").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    // tokio-cron-scheduler parses the schedule when the job is built
    Job::new_async(expr, |_uuid, _lock| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))
}
