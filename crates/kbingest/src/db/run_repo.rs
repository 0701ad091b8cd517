//! Bookkeeping for scheduled reconciliation runs (`reconcile_runs` table).

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub task: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub processed: u32,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            task: row.get("task")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            duration_ms: row.get("duration_ms")?,
            processed: row.get("processed")?,
            message: row.get("message")?,
            error: row.get("error")?,
        })
    }
}

/// Records the start of a run and returns its id.
pub fn start(db: &Database, task: &str, started_at: &str) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO reconcile_runs (task, status, started_at) VALUES (?1, 'running', ?2)",
            params![task, started_at],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Records a run that never started because another was still in progress.
pub fn record_skipped(db: &Database, task: &str, at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO reconcile_runs (task, status, started_at, finished_at, duration_ms, message)
             VALUES (?1, 'skipped', ?2, ?2, 0, 'previous run still in progress')",
            params![task, at],
        )?;
        Ok(())
    })
}

/// Closes a run as `completed` or `failed`.
pub fn finish(
    db: &Database,
    id: i64,
    finished_at: &str,
    duration_ms: i64,
    processed: u32,
    message: Option<&str>,
    error: Option<&str>,
) -> Result<(), DatabaseError> {
    let status = if error.is_some() { "failed" } else { "completed" };
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE reconcile_runs SET status = ?2, finished_at = ?3, duration_ms = ?4,
             processed = ?5, message = ?6, error = ?7
             WHERE id = ?1",
            params![id, status, finished_at, duration_ms, processed, message, error],
        )?;
        Ok(())
    })
}

/// Most recent runs of a task, newest first.
pub fn recent(db: &Database, task: &str, limit: u64) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM reconcile_runs WHERE task = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![task, limit as i64], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let id = start(&db, "confirmation", "2026-01-01T00:00:00Z").unwrap();
        finish(&db, id, "2026-01-01T00:00:01Z", 1000, 4, Some("4 jobs checked"), None).unwrap();
        record_skipped(&db, "confirmation", "2026-01-01T00:02:00Z").unwrap();

        let runs = recent(&db, "confirmation", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, "skipped");
        assert_eq!(runs[1].status, "completed");
        assert_eq!(runs[1].processed, 4);
        assert_eq!(runs[1].duration_ms, Some(1000));
    }

    #[test]
    fn test_failed_run() {
        let db = Database::open_in_memory().unwrap();
        let id = start(&db, "health", "2026-01-01T00:00:00Z").unwrap();
        finish(&db, id, "2026-01-01T00:00:01Z", 5, 0, None, Some("db locked")).unwrap();

        let runs = recent(&db, "health", 1).unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error.as_deref(), Some("db locked"));
    }
}
