use super::model::{OutboxMessageRow, RepositoryRow};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn init_pool(database_url: &str) -> sqlx::Result<Pool> {
    init_pool_with(database_url, 8).await
}

pub async fn init_pool_with(database_url: &str, max_connections: u32) -> sqlx::Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus FULL sync so a committed release survives a crash before notify.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

// Repository state

/// Insert a repository with no observed release. Existing rows are left alone.
#[instrument(skip_all, fields(id = %id))]
pub async fn register_repository(pool: &Pool, id: &str) -> sqlx::Result<bool> {
    let res = sqlx::query("INSERT OR IGNORE INTO repositories (id) VALUES (?)")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all, fields(id = %id))]
pub async fn fetch_repository(pool: &Pool, id: &str) -> sqlx::Result<Option<RepositoryRow>> {
    let row = sqlx::query("SELECT id, last_tag, last_update FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| RepositoryRow {
        id: row.get("id"),
        last_tag: row.get("last_tag"),
        last_update: row.get("last_update"),
    }))
}

#[instrument(skip_all)]
pub async fn list_repositories(pool: &Pool) -> sqlx::Result<Vec<RepositoryRow>> {
    let rows = sqlx::query("SELECT id, last_tag, last_update FROM repositories ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| RepositoryRow {
            id: row.get("id"),
            last_tag: row.get("last_tag"),
            last_update: row.get("last_update"),
        })
        .collect())
}

/// Write `(tag, update)` for `id` iff there is no row, the row has never been
/// observed, or its `last_update` is strictly older than `update`.
///
/// Runs as one statement, so racing writers are serialised by SQLite and each
/// sees the value left by the previous one. Returns whether the write applied.
#[instrument(skip_all, fields(id = %id, tag = %tag, update = update))]
pub async fn conditional_upsert_release(
    pool: &Pool,
    id: &str,
    tag: &str,
    update: i64,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "INSERT INTO repositories (id, last_tag, last_update) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET last_tag = excluded.last_tag, last_update = excluded.last_update \
         WHERE repositories.last_update IS NULL OR repositories.last_update < excluded.last_update",
    )
    .bind(id)
    .bind(tag)
    .bind(update)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// Release outbox

#[instrument(skip_all)]
pub async fn enqueue_message(pool: &Pool, payload: &str) -> sqlx::Result<i64> {
    let id: i64 = sqlx::query_scalar("INSERT INTO outbox (payload) VALUES (?) RETURNING id")
        .bind(payload)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn next_due_message(pool: &Pool) -> sqlx::Result<Option<OutboxMessageRow>> {
    let row = sqlx::query(
        "SELECT id, payload, attempt FROM outbox WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| OutboxMessageRow {
        id: row.get("id"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all, fields(id = id))]
pub async fn delete_message(pool: &Pool, id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push a message back by `5s * 2^attempt`, capped at `max_cap_secs` (or one
/// hour when the cap is not positive), and bump its attempt counter.
#[instrument(skip_all, fields(id = id, attempt = attempt))]
pub async fn backoff_message(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> sqlx::Result<i64> {
    let secs = backoff_delay_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(secs)
}

pub fn backoff_delay_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    secs.min(cap)
}

#[instrument(skip_all)]
pub async fn count_pending_messages(pool: &Pool) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = init_pool_with("sqlite::memory:", 1).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let pool = setup_pool().await;
        assert!(register_repository(&pool, "github.com/a/b").await.unwrap());
        assert!(!register_repository(&pool, "github.com/a/b").await.unwrap());

        let row = fetch_repository(&pool, "github.com/a/b").await.unwrap().unwrap();
        assert_eq!(row.last_tag, None);
        assert_eq!(row.last_update, None);
    }

    #[tokio::test]
    async fn register_keeps_existing_release() {
        let pool = setup_pool().await;
        assert!(conditional_upsert_release(&pool, "r1", "v1", 100).await.unwrap());
        assert!(!register_repository(&pool, "r1").await.unwrap());

        let row = fetch_repository(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(row.last_tag.as_deref(), Some("v1"));
        assert_eq!(row.last_update, Some(100));
    }

    #[tokio::test]
    async fn upsert_only_moves_forward() {
        let pool = setup_pool().await;
        register_repository(&pool, "r1").await.unwrap();

        assert!(conditional_upsert_release(&pool, "r1", "v1", 1_000).await.unwrap());
        assert!(!conditional_upsert_release(&pool, "r1", "v1", 1_000).await.unwrap());
        assert!(!conditional_upsert_release(&pool, "r1", "v0", 999).await.unwrap());
        assert!(conditional_upsert_release(&pool, "r1", "v2", 1_001).await.unwrap());

        let row = fetch_repository(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(row.last_tag.as_deref(), Some("v2"));
        assert_eq!(row.last_update, Some(1_001));
    }

    #[tokio::test]
    async fn outbox_backoff_and_delete_flow() {
        let pool = setup_pool().await;
        let id = enqueue_message(&pool, "{}").await.unwrap();

        let msg = next_due_message(&pool).await.unwrap().unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.attempt, 0);

        let delay = backoff_message(&pool, id, msg.attempt, 60).await.unwrap();
        assert_eq!(delay, 5);
        assert!(next_due_message(&pool).await.unwrap().is_none());
        assert_eq!(count_pending_messages(&pool).await.unwrap(), 1);

        delete_message(&pool, id).await.unwrap();
        assert_eq!(count_pending_messages(&pool).await.unwrap(), 0);
    }

    #[test]
    fn backoff_delay_is_capped() {
        assert_eq!(backoff_delay_secs(0, 60), 5);
        assert_eq!(backoff_delay_secs(3, 60), 40);
        assert_eq!(backoff_delay_secs(4, 60), 60);
        assert_eq!(backoff_delay_secs(30, 0), 3600);
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_rebuilt_with_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("watch.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }
}
