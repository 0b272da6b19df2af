//! The Durable Store (C1, §4.1): a `rusqlite`-backed embedded store for
//! jobs, target outcomes, and quarantine entries, under optimistic
//! concurrency via `Job::version_token`.
//!
//! Every mutating call runs inside one transaction: a crash mid-call either
//! leaves the prior row state intact or commits the full new state. The
//! connection is opened with WAL journaling, `synchronous=NORMAL`, and
//! foreign keys enabled (§6).

mod schema;
mod store;

pub use store::Store;

use forker_protocol::ForkerError;

/// Wrap a `rusqlite::Error` as a [`ForkerError::Io`] carrying `context` as
/// the path field, since the taxonomy (§7) has no dedicated database
/// variant and I/O failures are the closest fit for a storage backend.
pub(crate) fn map_sqlite_err(err: rusqlite::Error, context: &str) -> ForkerError {
    ForkerError::io(
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
        context.to_string(),
    )
}
