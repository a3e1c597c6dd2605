//! Pure release comparison.

use chrono::{DateTime, Utc};

use crate::model::{ReleaseEntry, RepositoryState};

/// Tag assumed for a repository that has never been observed.
pub const BASELINE_TAG: &str = "0.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoChange,
    Changed {
        tag: String,
        published_at: DateTime<Utc>,
    },
}

impl Decision {
    pub fn is_changed(&self) -> bool {
        matches!(self, Decision::Changed { .. })
    }
}

/// Decide whether `fetched` is a new release relative to `stored`.
///
/// A repository with no state (absent, or registered but never observed) is
/// always `Changed`. Otherwise a differing tag or a strictly newer timestamp
/// is a change.
pub fn decide(stored: Option<&RepositoryState>, fetched: &ReleaseEntry) -> Decision {
    let changed = match stored {
        Some(RepositoryState {
            last_tag,
            last_update: Some(last_update),
            ..
        }) => {
            let last_tag = last_tag.as_deref().unwrap_or(BASELINE_TAG);
            fetched.tag != last_tag || fetched.published_at > *last_update
        }
        _ => true,
    };

    if changed {
        Decision::Changed {
            tag: fetched.tag.clone(),
            published_at: fetched.published_at,
        }
    } else {
        Decision::NoChange
    }
}
