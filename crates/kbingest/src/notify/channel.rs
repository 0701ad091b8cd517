use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Notification, Notifier};
use crate::error::NotifyError;

/// Publishes notifications to in-process subscribers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: Arc<broadcast::Sender<Notification>>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn emit(&self, notification: &Notification) -> Result<(), NotifyError> {
        // No active receivers is fine
        if self.sender.send(notification.clone()).is_err() {
            log::trace!("Dropped notification '{}': no subscribers", notification.title);
        }
        Ok(())
    }
}
