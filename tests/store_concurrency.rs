use futures::future::join_all;
use release_watch::db;
use release_watch::model::{from_epoch_seconds, RepositoryState};
use release_watch::store::{CommitOutcome, SqliteStateStore, StateStore, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Connection, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tempfile::TempDir;

async fn setup_store() -> (TempDir, SqliteStateStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, SqliteStateStore::new(pool))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_commits_apply_exactly_once() {
    let (_dir, store) = setup_store().await;
    store
        .try_commit("r1", "v1.0.0", from_epoch_seconds(1_000))
        .await
        .unwrap();

    let handles = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .try_commit("r1", "v1.1.0", from_epoch_seconds(2_000))
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<CommitOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|res| res.unwrap())
        .collect();

    let committed = outcomes
        .iter()
        .filter(|o| **o == CommitOutcome::Committed)
        .count();
    assert_eq!(committed, 1, "outcomes: {outcomes:?}");
    assert_eq!(
        store.read("r1").await.unwrap(),
        Some(RepositoryState::observed("r1", "v1.1.0", from_epoch_seconds(2_000)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_values_leave_the_maximum() {
    let (_dir, store) = setup_store().await;
    store
        .try_commit("r1", "base", from_epoch_seconds(1_000))
        .await
        .unwrap();

    let handles = (1..=20_i64).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let secs = 1_000 + i * 50;
            let outcome = store
                .try_commit("r1", &format!("v{i}"), from_epoch_seconds(secs))
                .await
                .unwrap();
            (secs, outcome)
        })
    });
    let results: Vec<(i64, CommitOutcome)> = join_all(handles)
        .await
        .into_iter()
        .map(|res| res.unwrap())
        .collect();

    // The largest value can never lose: nothing is strictly greater than it.
    assert!(results.contains(&(2_000, CommitOutcome::Committed)));
    let state = store.read("r1").await.unwrap().unwrap();
    assert_eq!(state.last_tag.as_deref(), Some("v20"));
    assert_eq!(state.last_update, Some(from_epoch_seconds(2_000)));
}

#[tokio::test]
async fn rejected_commit_is_not_an_error_for_stale_values() {
    let (_dir, store) = setup_store().await;
    store
        .try_commit("r1", "v2", from_epoch_seconds(2_000))
        .await
        .unwrap();

    for secs in [2_000, 1_500, 0] {
        let outcome = store
            .try_commit("r1", "stale", from_epoch_seconds(secs))
            .await
            .expect("rejection is not a store error");
        assert_eq!(outcome, CommitOutcome::Rejected);
    }
}

#[tokio::test]
async fn locked_database_is_reported_as_throttled() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool.close().await;

    // Short busy timeout so the writer gives up quickly.
    let options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .busy_timeout(Duration::from_millis(50));
    let store = SqliteStateStore::new(
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap(),
    );

    let mut holder = SqliteConnection::connect(&url).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();

    let err = store
        .try_commit("r1", "v1", from_epoch_seconds(1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Throttled(_)), "got {err:?}");
    assert!(err.is_transient());

    sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
    assert_eq!(
        store
            .try_commit("r1", "v1", from_epoch_seconds(1_000))
            .await
            .unwrap(),
        CommitOutcome::Committed
    );
}

#[tokio::test]
async fn constraint_violation_is_a_backend_error() {
    let (_dir, store) = setup_store().await;

    // last_tag without last_update breaks the both-or-neither CHECK.
    let err = sqlx::query("INSERT INTO repositories (id, last_tag, last_update) VALUES ('r1', 'v1', NULL)")
        .execute(store.pool())
        .await
        .unwrap_err();
    let err = StoreError::from(err);
    assert!(matches!(err, StoreError::Backend(_)), "got {err:?}");
    assert!(!err.is_transient());
}
