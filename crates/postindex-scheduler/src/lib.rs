//! Multi-store scheduling for postindex.
//!
//! This crate runs the reconciliation engine over many stores at once and on
//! a cron schedule.
//!
//! ## Key Components
//!
//! - [`SyncCoordinator`]: one task per store, bounded by a semaphore
//! - [`StoreGuards`]: at most one in-flight run per store
//! - [`RunRegistry`]: last result and totals per store
//! - [`AutoSyncService`]: cron-driven sync of `auto_sync` stores
//!
//! ## Example
//!
//! ```ignore
//! use postindex_scheduler::{AutoSyncService, SchedulerConfig, SyncCoordinator};
//!
//! let config = SchedulerConfig::from_settings(&settings.scheduler)?;
//! let coordinator = Arc::new(SyncCoordinator::new(engine, &config));
//! let mut service = AutoSyncService::new(config).await?;
//! service.register_sync_job(coordinator).await?;
//! service.start().await?;
//! // ... on Ctrl+C
//! service.shutdown().await?;
//! ```

pub mod auto_sync;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod jitter;
pub mod overlap;
pub mod registry;

pub use auto_sync::AutoSyncService;
pub use config::{parse_timezone, validate_cron_expression, SchedulerConfig};
pub use coordinator::{StoreRunResult, SyncCoordinator, SyncSummary};
pub use error::SchedulerError;
pub use jitter::JitterConfig;
pub use overlap::{OverlapGuard, RunGuard, StoreGuards};
pub use registry::{LastRun, RunRegistry, StoreRunStatus};
