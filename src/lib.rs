//! Database backup service
//!
//! Dumps PostgreSQL, MySQL, MongoDB and Redis with their native client tools,
//! tracks each dump as a job, uploads artifacts to S3-compatible storage and
//! runs saved connection profiles on cron schedules.

// dbbackup/src/lib.rs
pub mod backup;
pub mod config;
pub mod engine;
pub mod errors;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod utils;

pub use backup::{DumpStrategy, StrategyRegistry};
pub use engine::{BackupEngine, EngineDeps, EngineSettings, JobSubmitter};
pub use model::{BackupJob, BackupRequest, BackupResult, Connection, DatabaseConfig, DatabaseType, JobStatus};
pub use scheduler::BackupScheduler;
