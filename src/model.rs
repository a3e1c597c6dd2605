use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Last known release of one tracked repository.
///
/// `last_tag` and `last_update` are either both set or both absent; a freshly
/// registered repository has neither until its first release is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryState {
    pub id: String,
    pub last_tag: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl RepositoryState {
    /// A registered repository that has never been observed.
    pub fn unobserved(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_tag: None,
            last_update: None,
        }
    }

    pub fn observed(id: impl Into<String>, tag: impl Into<String>, update: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_tag: Some(tag.into()),
            last_update: Some(update),
        }
    }

    pub fn is_observed(&self) -> bool {
        self.last_update.is_some()
    }
}

/// Newest entry of a release feed. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub tag: String,
    pub published_at: DateTime<Utc>,
}

impl ReleaseEntry {
    /// Builds an entry, truncating the timestamp to whole seconds to match
    /// the resolution the store persists.
    pub fn new(tag: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            tag: tag.into(),
            published_at: truncate_to_seconds(published_at),
        }
    }
}

/// A release transition that has already been committed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub repository_id: String,
    pub new_tag: String,
    pub new_update: DateTime<Utc>,
}

/// Queue payload describing a committed release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMessage {
    pub repository: String,
    pub latest_tag: String,
    pub latest_update: DateTime<Utc>,
}

impl From<&ChangeEvent> for ReleaseMessage {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            repository: event.repository_id.clone(),
            latest_tag: event.new_tag.clone(),
            latest_update: event.new_update,
        }
    }
}

pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch_seconds(ts.timestamp())
}

/// Converts stored epoch seconds back into a timestamp. Values outside
/// chrono's range clamp to the epoch.
pub fn from_epoch_seconds(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
