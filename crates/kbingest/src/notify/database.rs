use async_trait::async_trait;

use super::{Notification, Notifier};
use crate::db::notification_repo::{self, NotificationRow};
use crate::db::Database;
use crate::error::NotifyError;

/// Persists notifications to the `notifications` table so a user can read
/// them later.
#[derive(Clone)]
pub struct DatabaseNotifier {
    db: Database,
}

impl DatabaseNotifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Notifier for DatabaseNotifier {
    async fn emit(&self, notification: &Notification) -> Result<(), NotifyError> {
        let row = NotificationRow {
            id: 0,
            user_id: notification.user_id.clone(),
            kind: notification.kind.as_str().to_string(),
            category: notification.category.as_str().to_string(),
            title: notification.title.clone(),
            message: notification.message.clone(),
            metadata: serde_json::to_string(&notification.metadata)?,
            is_read: false,
            created_at: notification.created_at.to_rfc3339(),
        };
        let id = notification_repo::insert(&self.db, &row)?;
        log::debug!(
            "Stored {} notification {} for user {}",
            row.kind,
            id,
            row.user_id
        );
        Ok(())
    }
}
