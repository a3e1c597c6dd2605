//! One pass over every tracked repository.
//!
//! Each repository runs fetch → decide → commit → notify on its own. A
//! failure in one pipeline is recorded in the [`SweepReport`] and never stops
//! the others. Notification happens only after the store accepted the commit,
//! so a replayed or overlapping sweep that loses the commit race stays silent.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::detector::{decide, Decision};
use crate::feed::{FeedSource, FetchError};
use crate::model::{ChangeEvent, RepositoryState};
use crate::notifier::{NotifyError, Notifier};
use crate::store::{CommitOutcome, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Maximum repositories processed at the same time.
    pub concurrency: usize,
    /// Upper bound for each fetch, store and notify call.
    pub call_timeout: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
    /// The state already advanced; this transition will not be announced.
    #[error("release committed but notification failed: {source}")]
    Notify {
        event: ChangeEvent,
        #[source]
        source: NotifyError,
    },
}

#[derive(Debug)]
pub enum RepoOutcome {
    Unchanged,
    Committed(ChangeEvent),
    Rejected,
    /// Cancelled before anything was committed.
    Skipped,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct RepoFailure {
    pub repository: String,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub processed: usize,
    pub unchanged: usize,
    pub committed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failures: Vec<RepoFailure>,
    /// Events that were committed and handed to the notifier successfully.
    pub notified: Vec<ChangeEvent>,
}

impl SweepReport {
    fn new(sweep_id: Uuid) -> Self {
        Self {
            sweep_id,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, repository: String, outcome: RepoOutcome) {
        if matches!(outcome, RepoOutcome::Skipped) {
            self.skipped += 1;
            return;
        }
        self.processed += 1;
        match outcome {
            RepoOutcome::Unchanged => self.unchanged += 1,
            RepoOutcome::Rejected => self.rejected += 1,
            RepoOutcome::Committed(event) => {
                self.committed += 1;
                self.notified.push(event);
            }
            RepoOutcome::Failed(error) => {
                if matches!(error, PipelineError::Notify { .. }) {
                    self.committed += 1;
                }
                self.failures.push(RepoFailure { repository, error });
            }
            RepoOutcome::Skipped => {}
        }
    }
}

pub struct Sweeper {
    store: Arc<dyn StateStore>,
    feed: Arc<dyn FeedSource>,
    notifier: Arc<dyn Notifier>,
    options: SweepOptions,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        feed: Arc<dyn FeedSource>,
        notifier: Arc<dyn Notifier>,
        options: SweepOptions,
    ) -> Self {
        Self {
            store,
            feed,
            notifier,
            options,
        }
    }

    /// Run one sweep over every registered repository.
    ///
    /// Only a failure to enumerate the repositories fails the sweep as a whole.
    /// Once `cancel` fires, repositories that have not committed yet are skipped.
    #[instrument(skip_all, fields(sweep_id = tracing::field::Empty))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SweepReport, StoreError> {
        let sweep_id = Uuid::new_v4();
        tracing::Span::current().record("sweep_id", tracing::field::display(sweep_id));

        let repositories = self
            .bounded(self.store.list_all(), StoreError::Timeout)
            .await
            .map_err(|err| {
                error!(?err, "failed to enumerate repositories");
                err
            })?;
        info!(repositories = repositories.len(), "sweep started");

        let outcomes: Vec<(String, RepoOutcome)> = stream::iter(repositories)
            .map(|state| async move {
                let outcome = self.process(&state.id, Some(&state), cancel).await;
                (state.id, outcome)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport::new(sweep_id);
        for (repository, outcome) in outcomes {
            report.record(repository, outcome);
        }
        info!(
            processed = report.processed,
            unchanged = report.unchanged,
            committed = report.committed,
            rejected = report.rejected,
            skipped = report.skipped,
            failed = report.failed(),
            "sweep finished"
        );
        Ok(report)
    }

    /// Run the pipeline for a single repository using its current stored state.
    /// Returns `None` when the repository is not registered.
    pub async fn check(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RepoOutcome>, StoreError> {
        let stored = self.bounded(self.store.read(id), StoreError::Timeout).await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        Ok(Some(self.process(id, Some(&stored), cancel).await))
    }

    /// fetch → decide → try_commit → notify for one repository.
    #[instrument(skip_all, fields(repository = %id))]
    pub async fn process(
        &self,
        id: &str,
        stored: Option<&RepositoryState>,
        cancel: &CancellationToken,
    ) -> RepoOutcome {
        if cancel.is_cancelled() {
            return RepoOutcome::Skipped;
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RepoOutcome::Skipped,
            res = self.bounded(self.feed.fetch_latest(id), FetchError::Timeout) => res,
        };
        let fetched = match fetched {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "release feed unavailable");
                return RepoOutcome::Failed(err.into());
            }
        };

        let (tag, published_at) = match decide(stored, &fetched) {
            Decision::NoChange => {
                debug!(tag = %fetched.tag, "no new release");
                return RepoOutcome::Unchanged;
            }
            Decision::Changed { tag, published_at } => (tag, published_at),
        };

        // Last point where cancelling leaves no trace.
        if cancel.is_cancelled() {
            return RepoOutcome::Skipped;
        }

        match self
            .bounded(self.store.try_commit(id, &tag, published_at), StoreError::Timeout)
            .await
        {
            Ok(CommitOutcome::Committed) => {}
            Ok(CommitOutcome::Rejected) => {
                info!(%tag, "newer or equal release already committed elsewhere");
                return RepoOutcome::Rejected;
            }
            Err(err) => {
                warn!(%err, %tag, "release commit failed");
                return RepoOutcome::Failed(err.into());
            }
        }

        let event = ChangeEvent {
            repository_id: id.to_string(),
            new_tag: tag,
            new_update: published_at,
        };
        match self
            .bounded(self.notifier.notify(&event), NotifyError::Timeout)
            .await
        {
            Ok(()) => {
                info!(tag = %event.new_tag, "new release committed and notified");
                RepoOutcome::Committed(event)
            }
            Err(source) => {
                error!(err = %source, tag = %event.new_tag, "release committed but notification failed");
                RepoOutcome::Failed(PipelineError::Notify { event, source })
            }
        }
    }

    async fn bounded<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
        on_timeout: fn(Duration) -> E,
    ) -> Result<T, E> {
        match tokio::time::timeout(self.options.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(on_timeout(self.options.call_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::from_epoch_seconds;

    fn event(tag: &str) -> ChangeEvent {
        ChangeEvent {
            repository_id: "r".into(),
            new_tag: tag.into(),
            new_update: from_epoch_seconds(1),
        }
    }

    #[test]
    fn report_counts_lost_notifications_as_committed_failures() {
        let mut report = SweepReport::new(Uuid::nil());
        report.record("a".into(), RepoOutcome::Unchanged);
        report.record("b".into(), RepoOutcome::Committed(event("v1")));
        report.record("c".into(), RepoOutcome::Rejected);
        report.record("d".into(), RepoOutcome::Skipped);
        report.record(
            "e".into(),
            RepoOutcome::Failed(PipelineError::Notify {
                event: event("v2"),
                source: NotifyError::Timeout(Duration::from_secs(1)),
            }),
        );
        report.record(
            "f".into(),
            RepoOutcome::Failed(StoreError::Throttled("busy".into()).into()),
        );

        assert_eq!(report.processed, 5);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.committed, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.notified, vec![event("v1")]);
        assert_eq!(report.failures[0].repository, "e");
        assert!(!report.is_success());
    }
}
