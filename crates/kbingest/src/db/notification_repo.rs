//! Notification repository for the `notifications` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: String,
    pub kind: String,
    pub category: String,
    pub title: String,
    pub message: String,
    /// JSON object.
    pub metadata: String,
    pub is_read: bool,
    pub created_at: String,
}

impl NotificationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            kind: row.get("kind")?,
            category: row.get("category")?,
            title: row.get("title")?,
            message: row.get("message")?,
            metadata: row.get("metadata")?,
            is_read: row.get("is_read")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a notification and returns its row id. `id` and `is_read` on the
/// input are ignored.
pub fn insert(db: &Database, n: &NotificationRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO notifications (user_id, kind, category, title, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                n.user_id,
                n.kind,
                n.category,
                n.title,
                n.message,
                n.metadata,
                n.created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Lists a user's notifications, newest first.
pub fn list_for_user(
    db: &Database,
    user_id: &str,
    limit: u64,
) -> Result<Vec<NotificationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], NotificationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Marks one notification read. Returns `false` if it does not belong to the user.
pub fn mark_read(db: &Database, user_id: &str, id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(changed == 1)
    })
}

pub fn count_unread(db: &Database, user_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: &str, title: &str) -> NotificationRow {
        NotificationRow {
            id: 0,
            user_id: user_id.to_string(),
            kind: "success".to_string(),
            category: "batch_ingest".to_string(),
            title: title.to_string(),
            message: "done".to_string(),
            metadata: "{\"total\":3}".to_string(),
            is_read: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_insert_list_and_mark_read() {
        let db = Database::open_in_memory().unwrap();
        let first = insert(&db, &sample("u1", "first")).unwrap();
        insert(&db, &sample("u1", "second")).unwrap();
        insert(&db, &sample("u2", "other")).unwrap();

        let rows = list_for_user(&db, "u1", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "second");
        assert_eq!(count_unread(&db, "u1").unwrap(), 2);

        assert!(!mark_read(&db, "u2", first).unwrap());
        assert!(mark_read(&db, "u1", first).unwrap());
        assert_eq!(count_unread(&db, "u1").unwrap(), 1);
    }
}
