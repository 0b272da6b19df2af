//! The single error taxonomy shared by every crate in the workspace.

use thiserror::Error;

/// Errors raised anywhere in the replication engine.
///
/// Invariant and transition violations are programmer errors: they surface
/// immediately and are never retried. I/O errors route through the
/// classifier (`forker_orchestrator::classify`). Integrity errors always
/// escalate to job-level quarantine regardless of attempts remaining.
#[derive(Debug, Error)]
pub enum ForkerError {
    #[error("version conflict: expected {expected}, found {actual}")]
    Concurrency { expected: i64, actual: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invariant {id} violated on {entity}: {detail}")]
    InvariantViolation {
        id: &'static str,
        entity: &'static str,
        detail: String,
    },

    #[error("{entity} cannot transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("io error ({kind}) at {path}")]
    Io {
        kind: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity check failed at {path}: expected {expected}, computed {actual}")]
    Integrity {
        expected: String,
        actual: String,
        path: String,
    },

    #[error("configuration error on '{key}': {reason}")]
    Configuration { key: String, reason: String },
}

impl ForkerError {
    pub fn io(source: std::io::Error, path: impl Into<String>) -> Self {
        let kind = format!("{:?}", source.kind());
        Self::Io {
            kind,
            path: path.into(),
            source,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invariant(id: &'static str, entity: &'static str, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            id,
            entity,
            detail: detail.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type ForkerResult<T> = Result<T, ForkerError>;
