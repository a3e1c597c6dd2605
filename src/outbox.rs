//! Release queue consumer: renders queued release messages and posts them
//! to chat, acknowledging each one only after the post succeeded.

use crate::chat::ChatSink;
use crate::db::{self, Pool};
use crate::model::ReleaseMessage;
use anyhow::Result;
use tracing::{error, info, instrument, warn};

/// Plain-text announcement for one release.
pub fn render(message: &ReleaseMessage) -> String {
    let project = message
        .repository
        .split_once('/')
        .map(|(_host, path)| path)
        .unwrap_or(&message.repository);
    format!(
        "{} has been tagged with {}. Checkout the changelog at https://{}/releases/tag/{}.",
        project, message.latest_tag, message.repository, message.latest_tag
    )
}

/// Handle the next due message. Returns `false` when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_message(
    pool: &Pool,
    chat: &dyn ChatSink,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(row) = db::next_due_message(pool).await? else {
        return Ok(false);
    };

    let message: ReleaseMessage = match serde_json::from_str(&row.payload) {
        Ok(message) => message,
        Err(err) => {
            error!(?err, id = row.id, payload = %row.payload, "dropping undecodable release message");
            db::delete_message(pool, row.id).await?;
            return Ok(true);
        }
    };

    match chat.post(&message.repository, &render(&message)).await {
        Ok(()) => {
            db::delete_message(pool, row.id).await?;
            info!(
                id = row.id,
                repository = %message.repository,
                tag = %message.latest_tag,
                "release announced"
            );
        }
        Err(err) => {
            let delay = db::backoff_message(pool, row.id, row.attempt, max_backoff_secs).await?;
            warn!(
                ?err,
                id = row.id,
                attempt = row.attempt,
                delay_secs = delay,
                "release announcement failed; backoff"
            );
        }
    }
    Ok(true)
}

/// Process due messages until none remain due. Returns how many were handled.
pub async fn drain(pool: &Pool, chat: &dyn ChatSink, max_backoff_secs: i64) -> Result<usize> {
    let mut handled = 0;
    while process_next_message(pool, chat, max_backoff_secs).await? {
        handled += 1;
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_epoch_seconds;

    #[test]
    fn render_strips_host_from_project() {
        let message = ReleaseMessage {
            repository: "github.com/acme/widget".into(),
            latest_tag: "v1.1.0".into(),
            latest_update: from_epoch_seconds(2_000),
        };
        assert_eq!(
            render(&message),
            "acme/widget has been tagged with v1.1.0. Checkout the changelog at \
             https://github.com/acme/widget/releases/tag/v1.1.0."
        );
    }

    #[test]
    fn render_keeps_bare_ids() {
        let message = ReleaseMessage {
            repository: "r1".into(),
            latest_tag: "v2".into(),
            latest_update: from_epoch_seconds(0),
        };
        assert!(render(&message).starts_with("r1 has been tagged with v2."));
    }
}
