//! Durable per-repository release state with a conditional commit.
//!
//! The store is the only shared mutable resource in a sweep. It is never
//! locked explicitly: every writer goes through [`StateStore::try_commit`],
//! which applies a write only when it moves `last_update` strictly forward.
//! Losing that race yields [`CommitOutcome::Rejected`], which is an expected
//! outcome and must not be retried with the same values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{self, Pool, RepositoryRow};
use crate::model::{from_epoch_seconds, RepositoryState};

// Primary SQLite result codes (the low byte of an extended code).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_NOMEM: i32 = 7;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

/// Transport and capacity failures of the store. Callers decide on
/// retry and backoff; none of these mean the write lost a race.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store throughput exceeded: {0}")]
    Throttled(String),
    #[error("store capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether waiting and retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Backend(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::Throttled(err.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED) => StoreError::Throttled(err.to_string()),
                    Some(SQLITE_FULL | SQLITE_NOMEM) => StoreError::CapacityExceeded(err.to_string()),
                    Some(SQLITE_IOERR | SQLITE_CANTOPEN) => StoreError::Unavailable(err.to_string()),
                    _ => StoreError::Backend(err.to_string()),
                }
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Rejected,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<RepositoryState>, StoreError>;

    async fn list_all(&self) -> Result<Vec<RepositoryState>, StoreError>;

    /// Store `(new_tag, new_update)` for `id` iff no state exists or the stored
    /// `last_update` is strictly older than `new_update`.
    async fn try_commit(
        &self,
        id: &str,
        new_tag: &str,
        new_update: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;
}

/// [`StateStore`] over the `repositories` table.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl From<RepositoryRow> for RepositoryState {
    fn from(row: RepositoryRow) -> Self {
        match (row.last_tag, row.last_update) {
            (Some(tag), Some(update)) => {
                RepositoryState::observed(row.id, tag, from_epoch_seconds(update))
            }
            _ => RepositoryState::unobserved(row.id),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn read(&self, id: &str) -> Result<Option<RepositoryState>, StoreError> {
        let row = db::fetch_repository(&self.pool, id).await?;
        Ok(row.map(RepositoryState::from))
    }

    async fn list_all(&self) -> Result<Vec<RepositoryState>, StoreError> {
        let rows = db::list_repositories(&self.pool).await?;
        Ok(rows.into_iter().map(RepositoryState::from).collect())
    }

    async fn try_commit(
        &self,
        id: &str,
        new_tag: &str,
        new_update: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let applied =
            db::conditional_upsert_release(&self.pool, id, new_tag, new_update.timestamp()).await?;
        if applied {
            debug!(id, new_tag, "release state committed");
            Ok(CommitOutcome::Committed)
        } else {
            info!(id, new_tag, "release state already current; commit rejected");
            Ok(CommitOutcome::Rejected)
        }
    }
}
