use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use forker_ids::{JobId, QuarantineEntryId, TargetId};
use forker_protocol::{
    CopyState, ForkerError, ForkerResult, Job, JobState, QuarantineEntry, QuarantineStatus,
    TargetOutcome,
};

use crate::map_sqlite_err;
use crate::schema::migrate;

/// The durable store. Wraps a single `rusqlite::Connection` behind a mutex:
/// WAL mode lets SQLite itself serve concurrent readers without blocking
/// the writer at the file level, and every call here is a short-lived
/// transaction, so in-process callers never wait long for the lock (§4.1's
/// "reads never block writers... beyond brief commit windows").
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the database file at `path` and run the
    /// schema migration.
    pub fn open(path: impl AsRef<Path>) -> ForkerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ForkerError::io(e, parent.display().to_string())
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| map_sqlite_err(e, &path.display().to_string()))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, used by tests and by the corruption-injection
    /// test hook's scratch fixtures.
    pub fn open_in_memory() -> ForkerResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_sqlite_err(e, ":memory:"))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- Jobs --------------------------------------------------------

    /// Insert a brand-new job. Fails if `job.id` is already present.
    pub fn save_new_job(&self, job: &Job) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let required_targets = encode_targets(&job.required_targets)?;
        let rows = conn
            .execute(
                "INSERT INTO FileJobs
                    (Id, SourcePath, InitialSize, SourceHash, State, RequiredTargets, CreatedAt, VersionToken)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.as_str(),
                    job.source_path,
                    job.initial_size as i64,
                    job.source_hash,
                    job.state.as_str(),
                    required_targets,
                    job.created_at.to_rfc3339(),
                    job.version_token,
                ],
            )
            .map_err(|e| map_sqlite_err(e, "save_new_job"))?;
        debug_assert_eq!(rows, 1);
        Ok(())
    }

    /// Compare-and-set update keyed on `job.version_token`, which must equal
    /// the value the caller last read. On success the stored version token
    /// is incremented by exactly one and the updated [`Job`] (with the new
    /// token) is returned. `SourceHash` is enforced write-once (I10): once
    /// set in the store, a differing value is rejected.
    pub fn update_job(&self, job: &Job) -> ForkerResult<Job> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite_err(e, "update_job: begin"))?;

        let current: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT VersionToken, SourceHash FROM FileJobs WHERE Id = ?1",
                params![job.id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| map_sqlite_err(e, "update_job: read"))?;

        let (actual_version, existing_hash) = current
            .ok_or_else(|| ForkerError::not_found("Job", job.id.to_string()))?;

        if actual_version != job.version_token {
            return Err(ForkerError::Concurrency {
                expected: job.version_token,
                actual: actual_version,
            });
        }

        if let (Some(existing), Some(incoming)) = (&existing_hash, &job.source_hash) {
            if existing != incoming {
                return Err(ForkerError::invariant(
                    "I10",
                    "Job",
                    format!("source hash already set to {existing}, refusing {incoming}"),
                ));
            }
        }

        let required_targets = encode_targets(&job.required_targets)?;
        let new_version = job.version_token + 1;
        let rows = tx
            .execute(
                "UPDATE FileJobs SET
                    SourcePath = ?1, InitialSize = ?2, SourceHash = ?3, State = ?4,
                    RequiredTargets = ?5, VersionToken = ?6
                 WHERE Id = ?7 AND VersionToken = ?8",
                params![
                    job.source_path,
                    job.initial_size as i64,
                    job.source_hash,
                    job.state.as_str(),
                    required_targets,
                    new_version,
                    job.id.as_str(),
                    job.version_token,
                ],
            )
            .map_err(|e| map_sqlite_err(e, "update_job: write"))?;
        if rows != 1 {
            return Err(ForkerError::Concurrency {
                expected: job.version_token,
                actual: actual_version,
            });
        }

        tx.commit()
            .map_err(|e| map_sqlite_err(e, "update_job: commit"))?;

        let mut updated = job.clone();
        updated.version_token = new_version;
        Ok(updated)
    }

    pub fn get_job(&self, id: &JobId) -> ForkerResult<Job> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT Id, SourcePath, InitialSize, SourceHash, State, RequiredTargets, CreatedAt, VersionToken
             FROM FileJobs WHERE Id = ?1",
            params![id.as_str()],
            job_from_row,
        )
        .optional()
        .map_err(|e| map_sqlite_err(e, "get_job"))?
        .ok_or_else(|| ForkerError::not_found("Job", id.to_string()))?
    }

    pub fn list_by_state(&self, state: JobState) -> ForkerResult<Vec<Job>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT Id, SourcePath, InitialSize, SourceHash, State, RequiredTargets, CreatedAt, VersionToken
                 FROM FileJobs WHERE State = ?1 ORDER BY CreatedAt ASC",
            )
            .map_err(|e| map_sqlite_err(e, "list_by_state: prepare"))?;
        collect(&mut stmt, params![state.as_str()], job_from_row, "list_by_state")
    }

    pub fn list_by_source_path(&self, path: &str) -> ForkerResult<Vec<Job>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT Id, SourcePath, InitialSize, SourceHash, State, RequiredTargets, CreatedAt, VersionToken
                 FROM FileJobs WHERE SourcePath = ?1 ORDER BY CreatedAt ASC",
            )
            .map_err(|e| map_sqlite_err(e, "list_by_source_path: prepare"))?;
        collect(&mut stmt, params![path], job_from_row, "list_by_source_path")
    }

    pub fn counts_by_state(&self) -> ForkerResult<HashMap<JobState, i64>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT State, COUNT(*) FROM FileJobs GROUP BY State")
            .map_err(|e| map_sqlite_err(e, "counts_by_state: prepare"))?;
        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count))
            })
            .map_err(|e| map_sqlite_err(e, "counts_by_state: query"))?;

        let mut out = HashMap::new();
        for row in rows {
            let (state, count) = row.map_err(|e| map_sqlite_err(e, "counts_by_state: row"))?;
            let state = JobState::from_str(&state).map_err(|e| {
                ForkerError::invariant("I-db-row", "Job", format!("bad State column: {e}"))
            })?;
            out.insert(state, count);
        }
        Ok(out)
    }

    /// Deletes the job and, via `ON DELETE CASCADE`, every `TargetOutcome`
    /// and `QuarantineEntry` that references it.
    pub fn delete_job(&self, id: &JobId) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let rows = conn
            .execute("DELETE FROM FileJobs WHERE Id = ?1", params![id.as_str()])
            .map_err(|e| map_sqlite_err(e, "delete_job"))?;
        if rows == 0 {
            return Err(ForkerError::not_found("Job", id.to_string()));
        }
        Ok(())
    }

    // ---- TargetOutcomes ------------------------------------------------

    pub fn save_target_outcome(&self, outcome: &TargetOutcome) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO TargetOutcomes
                (JobId, TargetId, CopyState, Attempts, Hash, TempPath, FinalPath, LastError, LastTransitionAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                outcome.job_id.as_str(),
                outcome.target_id.as_str(),
                outcome.copy_state.as_str(),
                outcome.attempts,
                outcome.hash,
                outcome.temp_path,
                outcome.final_path,
                outcome.last_error,
                outcome.last_transition_at.to_rfc3339(),
            ],
        )
        .map_err(|e| map_sqlite_err(e, "save_target_outcome"))?;
        Ok(())
    }

    /// Overwrite the row for `(outcome.job_id, outcome.target_id)`. Unlike
    /// `update_job`, there is no version-token CAS here: §3 gives
    /// `TargetOutcome` no version field, since exactly one worker owns an
    /// attempt on a given target at any time (§5).
    pub fn update_target_outcome(&self, outcome: &TargetOutcome) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE TargetOutcomes SET
                    CopyState = ?1, Attempts = ?2, Hash = ?3, TempPath = ?4,
                    FinalPath = ?5, LastError = ?6, LastTransitionAt = ?7
                 WHERE JobId = ?8 AND TargetId = ?9",
                params![
                    outcome.copy_state.as_str(),
                    outcome.attempts,
                    outcome.hash,
                    outcome.temp_path,
                    outcome.final_path,
                    outcome.last_error,
                    outcome.last_transition_at.to_rfc3339(),
                    outcome.job_id.as_str(),
                    outcome.target_id.as_str(),
                ],
            )
            .map_err(|e| map_sqlite_err(e, "update_target_outcome"))?;
        if rows == 0 {
            return Err(ForkerError::not_found(
                "TargetOutcome",
                format!("{}/{}", outcome.job_id, outcome.target_id),
            ));
        }
        Ok(())
    }

    pub fn get_target_outcome(
        &self,
        job_id: &JobId,
        target_id: &TargetId,
    ) -> ForkerResult<TargetOutcome> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT JobId, TargetId, CopyState, Attempts, Hash, TempPath, FinalPath, LastError, LastTransitionAt
             FROM TargetOutcomes WHERE JobId = ?1 AND TargetId = ?2",
            params![job_id.as_str(), target_id.as_str()],
            target_outcome_from_row,
        )
        .optional()
        .map_err(|e| map_sqlite_err(e, "get_target_outcome"))?
        .ok_or_else(|| ForkerError::not_found("TargetOutcome", format!("{job_id}/{target_id}")))?
    }

    pub fn list_target_outcomes_for_job(&self, job_id: &JobId) -> ForkerResult<Vec<TargetOutcome>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT JobId, TargetId, CopyState, Attempts, Hash, TempPath, FinalPath, LastError, LastTransitionAt
                 FROM TargetOutcomes WHERE JobId = ?1 ORDER BY TargetId ASC",
            )
            .map_err(|e| map_sqlite_err(e, "list_target_outcomes_for_job: prepare"))?;
        collect(
            &mut stmt,
            params![job_id.as_str()],
            target_outcome_from_row,
            "list_target_outcomes_for_job",
        )
    }

    pub fn list_target_outcomes_by_copy_state(
        &self,
        state: CopyState,
    ) -> ForkerResult<Vec<TargetOutcome>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT JobId, TargetId, CopyState, Attempts, Hash, TempPath, FinalPath, LastError, LastTransitionAt
                 FROM TargetOutcomes WHERE CopyState = ?1 ORDER BY LastTransitionAt ASC",
            )
            .map_err(|e| map_sqlite_err(e, "list_target_outcomes_by_copy_state: prepare"))?;
        collect(
            &mut stmt,
            params![state.as_str()],
            target_outcome_from_row,
            "list_target_outcomes_by_copy_state",
        )
    }

    // ---- Quarantine ------------------------------------------------------

    pub fn save_quarantine_entry(&self, entry: &QuarantineEntry) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = encode_targets(&entry.affected_targets)?;
        conn.execute(
            "INSERT INTO QuarantineEntries
                (Id, JobId, SourcePath, ExpectedHash, Reason, AffectedTargets, QuarantinedAt,
                 Status, ReleaseReason, ReleasedBy, ReleasedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.as_str(),
                entry.job_id.as_str(),
                entry.source_path,
                entry.expected_hash,
                entry.reason,
                affected,
                entry.quarantined_at.to_rfc3339(),
                entry.status.as_str(),
                entry.release_reason,
                entry.released_by,
                entry.released_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| map_sqlite_err(e, "save_quarantine_entry"))?;
        Ok(())
    }

    pub fn update_quarantine_entry(&self, entry: &QuarantineEntry) -> ForkerResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let rows = conn
            .execute(
                "UPDATE QuarantineEntries SET
                    Status = ?1, ReleaseReason = ?2, ReleasedBy = ?3, ReleasedAt = ?4
                 WHERE Id = ?5",
                params![
                    entry.status.as_str(),
                    entry.release_reason,
                    entry.released_by,
                    entry.released_at.map(|t| t.to_rfc3339()),
                    entry.id.as_str(),
                ],
            )
            .map_err(|e| map_sqlite_err(e, "update_quarantine_entry"))?;
        if rows == 0 {
            return Err(ForkerError::not_found(
                "QuarantineEntry",
                entry.id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_quarantine_entry(&self, id: &QuarantineEntryId) -> ForkerResult<QuarantineEntry> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT Id, JobId, SourcePath, ExpectedHash, Reason, AffectedTargets, QuarantinedAt,
                    Status, ReleaseReason, ReleasedBy, ReleasedAt
             FROM QuarantineEntries WHERE Id = ?1",
            params![id.as_str()],
            quarantine_entry_from_row,
        )
        .optional()
        .map_err(|e| map_sqlite_err(e, "get_quarantine_entry"))?
        .ok_or_else(|| ForkerError::not_found("QuarantineEntry", id.to_string()))?
    }

    pub fn list_quarantine_entries(
        &self,
        status: Option<QuarantineStatus>,
    ) -> ForkerResult<Vec<QuarantineEntry>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let base = "SELECT Id, JobId, SourcePath, ExpectedHash, Reason, AffectedTargets, QuarantinedAt,
                            Status, ReleaseReason, ReleasedBy, ReleasedAt
                     FROM QuarantineEntries";
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!("{base} WHERE Status = ?1 ORDER BY QuarantinedAt ASC"))
                    .map_err(|e| map_sqlite_err(e, "list_quarantine_entries: prepare"))?;
                collect(
                    &mut stmt,
                    params![status.as_str()],
                    quarantine_entry_from_row,
                    "list_quarantine_entries",
                )
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("{base} ORDER BY QuarantinedAt ASC"))
                    .map_err(|e| map_sqlite_err(e, "list_quarantine_entries: prepare"))?;
                collect(
                    &mut stmt,
                    params![],
                    quarantine_entry_from_row,
                    "list_quarantine_entries",
                )
            }
        }
    }

    pub fn quarantine_stats(&self) -> ForkerResult<HashMap<QuarantineStatus, i64>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT Status, COUNT(*) FROM QuarantineEntries GROUP BY Status")
            .map_err(|e| map_sqlite_err(e, "quarantine_stats: prepare"))?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })
            .map_err(|e| map_sqlite_err(e, "quarantine_stats: query"))?;
        let mut out = HashMap::new();
        for row in rows {
            let (status, count) = row.map_err(|e| map_sqlite_err(e, "quarantine_stats: row"))?;
            let status = QuarantineStatus::from_str(&status).map_err(|e| {
                ForkerError::invariant(
                    "I-db-row",
                    "QuarantineEntry",
                    format!("bad Status column: {e}"),
                )
            })?;
            out.insert(status, count);
        }
        Ok(out)
    }
}

fn encode_targets(targets: &[TargetId]) -> ForkerResult<String> {
    let raw: Vec<&str> = targets.iter().map(TargetId::as_str).collect();
    serde_json::to_string(&raw).map_err(|e| ForkerError::Configuration {
        key: "RequiredTargets".into(),
        reason: e.to_string(),
    })
}

fn decode_targets(raw: &str) -> ForkerResult<Vec<TargetId>> {
    let raw: Vec<String> = serde_json::from_str(raw).map_err(|e| {
        ForkerError::invariant("I-db-row", "Job", format!("bad RequiredTargets column: {e}"))
    })?;
    raw.iter()
        .map(|s| {
            TargetId::parse(s.clone()).map_err(|e| {
                ForkerError::invariant("I-db-row", "Job", format!("bad target id '{s}': {e}"))
            })
        })
        .collect()
}

fn parse_timestamp(raw: &str, entity: &'static str) -> ForkerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ForkerError::invariant("I-db-row", entity, format!("bad timestamp '{raw}': {e}")))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ForkerResult<Job>> {
    let id: String = row.get(0)?;
    let source_path: String = row.get(1)?;
    let initial_size: i64 = row.get(2)?;
    let source_hash: Option<String> = row.get(3)?;
    let state: String = row.get(4)?;
    let required_targets: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let version_token: i64 = row.get(7)?;

    Ok((|| {
        Ok(Job {
            id: JobId::parse(&id)
                .map_err(|e| ForkerError::invariant("I-db-row", "Job", format!("bad Id: {e}")))?,
            source_path,
            initial_size: initial_size as u64,
            source_hash,
            state: JobState::from_str(&state)
                .map_err(|e| ForkerError::invariant("I-db-row", "Job", format!("bad State: {e}")))?,
            required_targets: decode_targets(&required_targets)?,
            created_at: parse_timestamp(&created_at, "Job")?,
            version_token,
        })
    })())
}

fn target_outcome_from_row(row: &Row<'_>) -> rusqlite::Result<ForkerResult<TargetOutcome>> {
    let job_id: String = row.get(0)?;
    let target_id: String = row.get(1)?;
    let copy_state: String = row.get(2)?;
    let attempts: u32 = row.get(3)?;
    let hash: Option<String> = row.get(4)?;
    let temp_path: Option<String> = row.get(5)?;
    let final_path: Option<String> = row.get(6)?;
    let last_error: Option<String> = row.get(7)?;
    let last_transition_at: String = row.get(8)?;

    Ok((|| {
        Ok(TargetOutcome {
            job_id: JobId::parse(&job_id).map_err(|e| {
                ForkerError::invariant("I-db-row", "TargetOutcome", format!("bad JobId: {e}"))
            })?,
            target_id: TargetId::parse(target_id.clone()).map_err(|e| {
                ForkerError::invariant("I-db-row", "TargetOutcome", format!("bad TargetId: {e}"))
            })?,
            copy_state: CopyState::from_str(&copy_state).map_err(|e| {
                ForkerError::invariant("I-db-row", "TargetOutcome", format!("bad CopyState: {e}"))
            })?,
            attempts,
            hash,
            temp_path,
            final_path,
            last_error,
            last_transition_at: parse_timestamp(&last_transition_at, "TargetOutcome")?,
        })
    })())
}

fn quarantine_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ForkerResult<QuarantineEntry>> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let source_path: String = row.get(2)?;
    let expected_hash: Option<String> = row.get(3)?;
    let reason: String = row.get(4)?;
    let affected_targets: String = row.get(5)?;
    let quarantined_at: String = row.get(6)?;
    let status: String = row.get(7)?;
    let release_reason: Option<String> = row.get(8)?;
    let released_by: Option<String> = row.get(9)?;
    let released_at: Option<String> = row.get(10)?;

    Ok((|| {
        Ok(QuarantineEntry {
            id: QuarantineEntryId::parse(&id).map_err(|e| {
                ForkerError::invariant("I-db-row", "QuarantineEntry", format!("bad Id: {e}"))
            })?,
            job_id: JobId::parse(&job_id).map_err(|e| {
                ForkerError::invariant("I-db-row", "QuarantineEntry", format!("bad JobId: {e}"))
            })?,
            source_path,
            expected_hash,
            reason,
            affected_targets: decode_targets(&affected_targets)?,
            quarantined_at: parse_timestamp(&quarantined_at, "QuarantineEntry")?,
            status: QuarantineStatus::from_str(&status).map_err(|e| {
                ForkerError::invariant("I-db-row", "QuarantineEntry", format!("bad Status: {e}"))
            })?,
            release_reason,
            released_by,
            released_at: released_at
                .map(|raw| parse_timestamp(&raw, "QuarantineEntry"))
                .transpose()?,
        })
    })())
}

/// Run `stmt` with `params`, mapping each row through `f` and flattening the
/// two layers of fallibility (`rusqlite::Error` from the driver, then
/// `ForkerError` from row-to-entity conversion) into one `ForkerResult`.
fn collect<T, F>(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
    f: F,
    context: &str,
) -> ForkerResult<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<ForkerResult<T>>,
{
    let rows = stmt
        .query_map(params, f)
        .map_err(|e| map_sqlite_err(e, context))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| map_sqlite_err(e, context))??);
    }
    Ok(out)
}
