//! Append-only run ledger.
//!
//! Every sync or matcher invocation writes exactly one row, whatever its
//! outcome. The orchestrator inserts the fully-populated record at
//! finalization; rows are never mutated afterwards.

use rusqlite::params;
use serde::Serialize;

use super::{DbError, Warehouse};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Zero failures.
    Success,
    /// Some rows written, some failed — success with caveats, not an error.
    Partial,
    /// Nothing written.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Requested scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(SyncMode::Full),
            "incremental" => Some(SyncMode::Incremental),
            _ => None,
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub source: String,
    pub scope: String,
    pub mode: String,
    pub status: String,
    pub processed: u64,
    pub failed: u64,
    pub matched: u64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

impl Warehouse {
    /// Append one run record.
    pub fn record_run(&self, run: &RunRecord) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_runs (
                id, source, scope, mode, status, processed, failed, matched,
                started_at, finished_at, error
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id,
                run.source,
                run.scope,
                run.mode,
                run.status,
                run.processed as i64,
                run.failed as i64,
                run.matched as i64,
                run.started_at,
                run.finished_at,
                run.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source, scope, mode, status, processed, failed, matched,
                    started_at, finished_at, error
             FROM sync_runs
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunRecord {
                id: row.get(0)?,
                source: row.get(1)?,
                scope: row.get(2)?,
                mode: row.get(3)?,
                status: row.get(4)?,
                processed: row.get::<_, i64>(5)? as u64,
                failed: row.get::<_, i64>(6)? as u64,
                matched: row.get::<_, i64>(7)? as u64,
                started_at: row.get(8)?,
                finished_at: row.get(9)?,
                error: row.get(10)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_run(id: &str, started_at: &str, status: RunStatus) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            source: "mailbox".to_string(),
            scope: "default".to_string(),
            mode: "incremental".to_string(),
            status: status.as_str().to_string(),
            processed: 98,
            failed: 2,
            matched: 0,
            started_at: started_at.to_string(),
            finished_at: Some(format!("{started_at}+1")),
            error: None,
        }
    }

    #[test]
    fn test_record_and_list_runs() {
        let db = Warehouse::open_in_memory().unwrap();
        db.record_run(&make_run("r1", "2026-02-01T00:00:00Z", RunStatus::Partial))
            .unwrap();
        db.record_run(&make_run("r2", "2026-02-02T00:00:00Z", RunStatus::Success))
            .unwrap();

        let runs = db.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        // Newest first
        assert_eq!(runs[0].id, "r2");
        assert_eq!(runs[1].status, "partial");
        assert_eq!(runs[1].processed, 98);
        assert_eq!(runs[1].failed, 2);
    }

    #[test]
    fn test_failed_runs_are_ledgered_too() {
        let db = Warehouse::open_in_memory().unwrap();
        let mut run = make_run("r3", "2026-02-03T00:00:00Z", RunStatus::Failed);
        run.processed = 0;
        run.error = Some("auth expired".into());
        db.record_run(&run).unwrap();

        let runs = db.recent_runs(1).unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error.as_deref(), Some("auth expired"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(SyncMode::parse("full"), Some(SyncMode::Full));
        assert_eq!(SyncMode::parse("incremental"), Some(SyncMode::Incremental));
        assert_eq!(SyncMode::parse("weekly"), None);
    }
}
