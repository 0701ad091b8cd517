//! Job repository for the `ingestion_jobs` table.
//!
//! Status changes are conditional updates (`WHERE status IN (...)`) so that
//! two writers racing on the same job cannot both apply a transition. The
//! returned `bool` tells the caller whether its write won.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::item_repo::{self, ItemRow};
use super::{Database, DatabaseError};
use crate::model::JobStatus;

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub owner_id: String,
    pub status: String,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub external_index_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
    pub retired: bool,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            owner_id: row.get("owner_id")?,
            status: row.get("status")?,
            total_items: row.get("total_items")?,
            completed_items: row.get("completed_items")?,
            failed_items: row.get("failed_items")?,
            external_index_ref: row.get("external_index_ref")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
            retired: row.get("retired")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub status: Option<String>,
    pub include_retired: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a job and all of its items in one transaction.
pub fn insert_with_items(
    db: &Database,
    job: &JobRow,
    items: &[ItemRow],
) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO ingestion_jobs (id, job_type, owner_id, status, total_items,
             completed_items, failed_items, external_index_ref, error_message, created_at,
             started_at, completed_at, updated_at, retired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.job_type,
                job.owner_id,
                job.status,
                job.total_items,
                job.completed_items,
                job.failed_items,
                job.external_index_ref,
                job.error_message,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
                job.retired,
            ],
        )?;
        for (position, item) in items.iter().enumerate() {
            item_repo::insert_in(tx, item, position as u32)?;
        }
        Ok(())
    })
}

pub(crate) fn find_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM ingestion_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?)
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Reads a job and its items under one lock so counters and item states agree.
pub fn snapshot(db: &Database, id: &str) -> Result<Option<(JobRow, Vec<ItemRow>)>, DatabaseError> {
    db.with_conn(|conn| {
        let Some(job) = find_in(conn, id)? else {
            return Ok(None);
        };
        let items = item_repo::list_in(conn, id)?;
        Ok(Some((job, items)))
    })
}

/// Queries jobs with filters, returning (rows, total_count). Newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref owner_id) = filter.owner_id {
            conditions.push(format!("owner_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(owner_id.clone()));
        }
        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if !filter.include_retired {
            conditions.push("retired = 0".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM ingestion_jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(50) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM ingestion_jobs {} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Lists non-retired jobs in any of the given statuses, oldest first.
pub fn list_by_status(db: &Database, statuses: &[JobStatus]) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM ingestion_jobs WHERE retired = 0 AND status IN ({}) ORDER BY created_at ASC",
            placeholders
        );
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves a job from any of `from` into `to`. Returns `false` when the job was
/// not in one of the expected states.
pub fn transition(
    db: &Database,
    id: &str,
    from: &[JobStatus],
    to: JobStatus,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| transition_in(conn, id, from, to, now))
}

pub(crate) fn transition_in(
    conn: &Connection,
    id: &str,
    from: &[JobStatus],
    to: JobStatus,
    now: &str,
) -> Result<bool, DatabaseError> {
    let placeholders = (0..from.len())
        .map(|i| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE ingestion_jobs SET status = ?2, updated_at = ?3,
         started_at = CASE WHEN ?2 = 'processing' THEN COALESCE(started_at, ?3) ELSE started_at END
         WHERE id = ?1 AND status IN ({})",
        placeholders
    );
    let mut values: Vec<String> = vec![id.to_string(), to.as_str().to_string(), now.to_string()];
    values.extend(from.iter().map(|s| s.as_str().to_string()));
    let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(changed == 1)
}

/// Moves a processing job into `awaiting_external_confirmation`, recording the
/// indexing pass reference when one was started.
pub fn mark_awaiting(
    db: &Database,
    id: &str,
    external_index_ref: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_jobs SET status = 'awaiting_external_confirmation',
             external_index_ref = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![id, external_index_ref, now],
        )?;
        Ok(changed == 1)
    })
}

/// Records a late-started indexing pass on a job that is still awaiting.
pub fn set_external_ref(
    db: &Database,
    id: &str,
    external_index_ref: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_jobs SET external_index_ref = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'awaiting_external_confirmation'",
            params![id, external_index_ref, now],
        )?;
        Ok(changed == 1)
    })
}

/// Writes a terminal status if the job is still in `from`. Only one caller
/// can win this update, which is what makes finalization idempotent.
pub fn finalize(
    db: &Database,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    error_message: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_jobs SET status = ?3, completed_at = ?5, updated_at = ?5,
             error_message = COALESCE(?4, error_message)
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), error_message, now],
        )?;
        Ok(changed == 1)
    })
}

/// Fails a job together with every item that had completed, in one
/// transaction. Used when the external indexing pass failed, which makes
/// every registered item unusable. Returns `false` when the job was no
/// longer in `from`; nothing is touched in that case.
pub fn fail_with_items(
    db: &Database,
    id: &str,
    from: JobStatus,
    error_message: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let claimed = tx.execute(
            "UPDATE ingestion_jobs SET status = 'failed', error_message = ?3,
             completed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), error_message, now],
        )?;
        if claimed == 0 {
            return Ok(false);
        }
        let moved = tx.execute(
            "UPDATE ingestion_items SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE job_id = ?1 AND status = 'completed'",
            params![id, error_message, now],
        )?;
        tx.execute(
            "UPDATE ingestion_jobs SET completed_items = completed_items - ?2,
             failed_items = failed_items + ?2
             WHERE id = ?1",
            params![id, moved as u32],
        )?;
        Ok(true)
    })
}

/// Soft-retires a terminal job. Retired jobs are hidden from listings and
/// never picked up by reconciliation.
pub fn retire(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_jobs SET retired = 1, updated_at = ?2
             WHERE id = ?1 AND retired = 0
             AND status IN ('completed', 'partially_completed', 'failed', 'cancelled')",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}
