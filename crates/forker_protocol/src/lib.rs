//! Shared domain types, state machines, configuration, and error taxonomy
//! for the clinically-safe file replication engine.

pub mod config;
pub mod error;
pub mod job;
pub mod quarantine;
pub mod target;

pub use config::{
    DatabaseConfig, DirectoriesConfig, Environment, ForkerConfig, LoggingConfig, MonitoringConfig,
    TargetConfig, TestingConfig,
};
pub use error::{ForkerError, ForkerResult};
pub use job::{job_transition_allowed, Job, JobState};
pub use quarantine::{QuarantineEntry, QuarantineStatus};
pub use target::{copy_transition_allowed, CopyState, TargetOutcome};

pub use forker_ids::{IdParseError, JobId, QuarantineEntryId, TargetId};
