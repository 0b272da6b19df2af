//! Schema creation for the durable store (§6). Single source of truth for
//! every `CREATE TABLE` / index statement; run once per connection at open
//! time via `IF NOT EXISTS` so repeated opens of an existing database file
//! are no-ops.

use rusqlite::Connection;

use crate::map_sqlite_err;
use forker_protocol::ForkerError;

pub(crate) fn migrate(conn: &Connection) -> Result<(), ForkerError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(|e| map_sqlite_err(e, "migrate: pragmas"))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS FileJobs (
            Id              TEXT PRIMARY KEY,
            SourcePath      TEXT NOT NULL,
            InitialSize     INTEGER NOT NULL CHECK (InitialSize >= 0),
            SourceHash      TEXT,
            State           TEXT NOT NULL,
            RequiredTargets TEXT NOT NULL,
            CreatedAt       TEXT NOT NULL,
            VersionToken    INTEGER NOT NULL CHECK (VersionToken > 0)
        );

        CREATE TABLE IF NOT EXISTS TargetOutcomes (
            JobId             TEXT NOT NULL REFERENCES FileJobs(Id) ON DELETE CASCADE,
            TargetId          TEXT NOT NULL,
            CopyState         TEXT NOT NULL,
            Attempts          INTEGER NOT NULL CHECK (Attempts >= 0),
            Hash              TEXT,
            TempPath          TEXT,
            FinalPath         TEXT,
            LastError         TEXT,
            LastTransitionAt  TEXT NOT NULL,
            PRIMARY KEY (JobId, TargetId)
        );

        CREATE TABLE IF NOT EXISTS QuarantineEntries (
            Id              TEXT PRIMARY KEY,
            JobId           TEXT NOT NULL REFERENCES FileJobs(Id) ON DELETE CASCADE,
            SourcePath      TEXT NOT NULL,
            ExpectedHash    TEXT,
            Reason          TEXT NOT NULL,
            AffectedTargets TEXT NOT NULL,
            QuarantinedAt   TEXT NOT NULL,
            Status          TEXT NOT NULL,
            ReleaseReason   TEXT,
            ReleasedBy      TEXT,
            ReleasedAt      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_filejobs_state ON FileJobs(State);
        CREATE INDEX IF NOT EXISTS idx_filejobs_created_at ON FileJobs(CreatedAt);
        CREATE INDEX IF NOT EXISTS idx_filejobs_source_path ON FileJobs(SourcePath);
        CREATE INDEX IF NOT EXISTS idx_targetoutcomes_copy_state ON TargetOutcomes(CopyState);
        CREATE INDEX IF NOT EXISTS idx_targetoutcomes_last_transition_at ON TargetOutcomes(LastTransitionAt);
        CREATE INDEX IF NOT EXISTS idx_quarantine_job_id ON QuarantineEntries(JobId);
        CREATE INDEX IF NOT EXISTS idx_quarantine_status ON QuarantineEntries(Status);",
    )
    .map_err(|e| map_sqlite_err(e, "migrate: schema"))
}
