use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::db::{self, Pool};
use crate::model::{ChangeEvent, ReleaseMessage};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode release message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to enqueue release message: {0}")]
    Enqueue(#[from] sqlx::Error),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Publishes committed release transitions.
///
/// Implementations are only ever handed events whose state commit already
/// succeeded; a failure here does not undo that commit.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError>;
}

/// Enqueues [`ReleaseMessage`] payloads onto the release outbox table,
/// which the chat consumer drains.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    pool: Pool,
}

impl OutboxNotifier {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(&ReleaseMessage::from(event))?;
        let message_id = db::enqueue_message(&self.pool, &payload).await?;
        info!(
            message_id,
            repository = %event.repository_id,
            tag = %event.new_tag,
            "release message enqueued"
        );
        Ok(())
    }
}
