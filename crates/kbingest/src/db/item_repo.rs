//! Item repository for the `ingestion_items` table.
//!
//! Terminal item transitions and the owning job's counters are written in
//! the same transaction, so `completed_items + failed_items` always matches
//! the item rows.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::model::ItemStatus;

/// A raw item row from the database.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: String,
    pub job_id: String,
    pub item_type: String,
    pub source_url: String,
    pub title: String,
    pub status: String,
    pub created_entity_ref: Option<String>,
    pub storage_url: Option<String>,
    pub data_source_id: Option<String>,
    pub subject_ref: Option<String>,
    pub year: Option<i32>,
    pub month: Option<String>,
    pub exam_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            item_type: row.get("item_type")?,
            source_url: row.get("source_url")?,
            title: row.get("title")?,
            status: row.get("status")?,
            created_entity_ref: row.get("created_entity_ref")?,
            storage_url: row.get("storage_url")?,
            data_source_id: row.get("data_source_id")?,
            subject_ref: row.get("subject_ref")?,
            year: row.get("year")?,
            month: row.get("month")?,
            exam_type: row.get("exam_type")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Per-status item counts for one job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ItemCounts {
    pub pending: u32,
    pub in_flight: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl ItemCounts {
    /// True once no item is waiting or running.
    pub fn all_resolved(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

pub(crate) fn insert_in(
    conn: &Connection,
    item: &ItemRow,
    position: u32,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO ingestion_items (id, job_id, position, item_type, source_url, title, status,
         created_entity_ref, storage_url, data_source_id, subject_ref, year, month, exam_type,
         error_message, created_at, started_at, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            item.id,
            item.job_id,
            position,
            item.item_type,
            item.source_url,
            item.title,
            item.status,
            item.created_entity_ref,
            item.storage_url,
            item.data_source_id,
            item.subject_ref,
            item.year,
            item.month,
            item.exam_type,
            item.error_message,
            item.created_at,
            item.started_at,
            item.completed_at,
            item.updated_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn list_in(conn: &Connection, job_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM ingestion_items WHERE job_id = ?1 ORDER BY position ASC")?;
    let rows = stmt
        .query_map(params![job_id], ItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists a job's items in submission order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    db.with_conn(|conn| list_in(conn, job_id))
}

/// Finds an item by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM ingestion_items WHERE id = ?1",
                params![id],
                ItemRow::from_row,
            )
            .optional()?)
    })
}

/// Moves an item one pipeline step forward. Returns `false` if the item was
/// no longer in `from` (for example it was cancelled in the meantime).
pub fn advance(
    db: &Database,
    id: &str,
    from: ItemStatus,
    to: ItemStatus,
    now: &str,
) -> Result<bool, DatabaseError> {
    if !from.can_advance_to(to) || to.is_terminal() {
        return Ok(false);
    }
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_items SET status = ?3, updated_at = ?4,
             started_at = COALESCE(started_at, ?4)
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), now],
        )?;
        Ok(changed == 1)
    })
}

/// Records where the item's bytes were stored.
pub fn set_storage_url(db: &Database, id: &str, url: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE ingestion_items SET storage_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, url, now],
        )?;
        Ok(())
    })
}

/// Marks an item completed and bumps the job's `completed_items`.
pub fn complete(
    db: &Database,
    id: &str,
    from: ItemStatus,
    created_entity_ref: &str,
    data_source_id: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let Some(job_id) = job_id_in(tx, id)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE ingestion_items SET status = 'completed', created_entity_ref = ?3,
             data_source_id = ?4, error_message = NULL, completed_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), created_entity_ref, data_source_id, now],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE ingestion_jobs SET completed_items = completed_items + 1, updated_at = ?2
                 WHERE id = ?1",
                params![job_id, now],
            )?;
        }
        Ok(changed == 1)
    })
}

/// Marks a non-terminal item failed and bumps the job's `failed_items`.
pub fn fail(db: &Database, id: &str, error: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let Some(job_id) = job_id_in(tx, id)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE ingestion_items SET status = 'failed', error_message = ?2,
             completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![id, error, now],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE ingestion_jobs SET failed_items = failed_items + 1, updated_at = ?2
                 WHERE id = ?1",
                params![job_id, now],
            )?;
        }
        Ok(changed == 1)
    })
}

/// Cancels every item of the job that has not started yet.
pub fn cancel_pending(db: &Database, job_id: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_items SET status = 'cancelled', completed_at = ?2, updated_at = ?2
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id, now],
        )?;
        Ok(changed)
    })
}

/// Resets a failed or cancelled item to `pending` and reopens its job.
///
/// The item's previous outcome is removed from the job counters and the job
/// goes back to `processing` with its completion time and error cleared.
/// Returns `false` when the item was not in a retryable state.
pub fn reset_for_retry(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT job_id, status FROM ingestion_items WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((job_id, status)) = current else {
            return Ok(false);
        };
        let status = ItemStatus::parse(&status, id);
        if !matches!(status, ItemStatus::Failed | ItemStatus::Cancelled) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE ingestion_items SET status = 'pending', error_message = NULL,
             created_entity_ref = NULL, storage_url = NULL, data_source_id = NULL,
             started_at = NULL, completed_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        let failed_delta: u32 = if status == ItemStatus::Failed { 1 } else { 0 };
        tx.execute(
            "UPDATE ingestion_jobs SET failed_items = failed_items - ?2, status = 'processing',
             completed_at = NULL, error_message = NULL, updated_at = ?3,
             started_at = COALESCE(started_at, ?3)
             WHERE id = ?1",
            params![job_id, failed_delta, now],
        )?;
        Ok(true)
    })
}

/// Puts items interrupted mid-pipeline (by a restart) back to `pending`.
pub fn reset_interrupted(db: &Database, job_id: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE ingestion_items SET status = 'pending', updated_at = ?2
             WHERE job_id = ?1 AND status IN ('fetching', 'validating', 'storing', 'registering')",
            params![job_id, now],
        )?;
        Ok(changed)
    })
}

/// Counts a job's items by status.
pub fn counts(db: &Database, job_id: &str) -> Result<ItemCounts, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM ingestion_items WHERE job_id = ?1 GROUP BY status",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = ItemCounts::default();
        for (status, n) in rows {
            match ItemStatus::parse(&status, job_id) {
                ItemStatus::Pending => counts.pending += n,
                ItemStatus::Completed => counts.completed += n,
                ItemStatus::Failed => counts.failed += n,
                ItemStatus::Cancelled => counts.cancelled += n,
                _ => counts.in_flight += n,
            }
        }
        Ok(counts)
    })
}

/// Data source ids of every completed item in the job.
pub fn registered_data_sources(db: &Database, job_id: &str) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT data_source_id FROM ingestion_items
             WHERE job_id = ?1 AND status = 'completed' AND data_source_id IS NOT NULL
             ORDER BY position ASC",
        )?;
        let ids = stmt
            .query_map(params![job_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

fn job_id_in(conn: &Connection, item_id: &str) -> Result<Option<String>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT job_id FROM ingestion_items WHERE id = ?1",
            params![item_id],
            |r| r.get(0),
        )
        .optional()?)
}
