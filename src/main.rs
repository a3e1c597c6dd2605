use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use release_watch::chat::TelegramChat;
use release_watch::config::{self, Config};
use release_watch::db;
use release_watch::feed::HttpFeedSource;
use release_watch::notifier::OutboxNotifier;
use release_watch::outbox;
use release_watch::registry;
use release_watch::store::{SqliteStateStore, StateStore};
use release_watch::sweep::{RepoOutcome, Sweeper};

#[derive(Debug, Parser)]
#[command(author, version, about = "Watch release feeds and announce new releases")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sweep over every registered repository and exit
    Sweep,
    /// Run the pipeline for one registered repository
    Check { repository: String },
    /// Register repositories for tracking
    Register { repositories: Vec<String> },
    /// Print every tracked repository and its last known release
    List,
    /// Post all due release messages to chat and exit
    Deliver,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.app.database_url)
        .await
        .context("failed to open registry database")?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Sweep => {
            let registration = registry::register_all(&pool, cfg.tracked_repositories()).await?;
            if registration.created > 0 {
                info!(created = registration.created, "registered repositories from config");
            }
            for raw in &registration.invalid {
                println!("  skipped invalid repository id {:?}", raw);
            }

            let sweeper = build_sweeper(&cfg, pool).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling sweep");
                    on_signal.cancel();
                }
            });

            let report = sweeper.run(&cancel).await?;
            println!(
                "sweep {}: processed={} unchanged={} committed={} rejected={} skipped={} failed={}",
                report.sweep_id,
                report.processed,
                report.unchanged,
                report.committed,
                report.rejected,
                report.skipped,
                report.failed()
            );
            for event in &report.notified {
                println!("  new release {} {}", event.repository_id, event.new_tag);
            }
            for failure in &report.failures {
                println!("  failed {}: {}", failure.repository, failure.error);
            }
            if !report.is_success() {
                bail!(
                    "sweep {}: {} of {} repositories failed",
                    report.sweep_id,
                    report.failed(),
                    report.processed
                );
            }
        }
        Command::Check { repository } => {
            let id = registry::normalize(&repository)?;
            let sweeper = build_sweeper(&cfg, pool).await?;
            match sweeper.check(&id, &CancellationToken::new()).await? {
                None => println!("{} is not registered", id),
                Some(RepoOutcome::Unchanged) => println!("{}: no new release", id),
                Some(RepoOutcome::Committed(event)) => {
                    println!("{}: new release {}", id, event.new_tag)
                }
                Some(RepoOutcome::Rejected) => println!("{}: already up to date", id),
                Some(RepoOutcome::Skipped) => println!("{}: cancelled", id),
                Some(RepoOutcome::Failed(err)) => {
                    return Err(anyhow::Error::new(err).context(format!("check failed for {}", id)));
                }
            }
        }
        Command::Register { repositories } => {
            for raw in &repositories {
                let (id, created) = registry::register(&pool, raw).await?;
                if created {
                    println!("registered {}", id);
                } else {
                    println!("{} already tracked", id);
                }
            }
        }
        Command::List => {
            let store = SqliteStateStore::new(pool);
            for state in store.list_all().await? {
                match (state.last_tag, state.last_update) {
                    (Some(tag), Some(update)) => {
                        println!("{}\t{}\t{}", state.id, tag, update.to_rfc3339())
                    }
                    _ => println!("{}\t-\t-", state.id),
                }
            }
        }
        Command::Deliver => {
            let queue = open_queue(&cfg, &pool).await?;
            let chat = TelegramChat::new(cfg.telegram.bot_token.clone(), cfg.telegram.chat_id)
                .with_routes(cfg.chat_routes());
            let handled =
                outbox::drain(&queue, &chat, cfg.app.max_backoff_seconds as i64).await?;
            let remaining = db::count_pending_messages(&queue).await?;
            info!(handled, remaining, "release queue drained");
        }
    }

    Ok(())
}

async fn build_sweeper(cfg: &Config, pool: db::Pool) -> Result<Sweeper> {
    let queue = open_queue(cfg, &pool).await?;
    let http = HttpFeedSource::default_client(&cfg.feed.user_agent, cfg.call_timeout())
        .context("failed to build HTTP client")?;
    Ok(Sweeper::new(
        Arc::new(SqliteStateStore::new(pool)),
        Arc::new(HttpFeedSource::with_url_template(http, cfg.feed.url_template.clone())),
        Arc::new(OutboxNotifier::new(queue)),
        cfg.sweep_options(),
    ))
}

async fn open_queue(cfg: &Config, registry_pool: &db::Pool) -> Result<db::Pool> {
    if cfg.queue_url() == cfg.app.database_url {
        return Ok(registry_pool.clone());
    }
    let queue = db::init_pool(cfg.queue_url())
        .await
        .context("failed to open release queue database")?;
    db::run_migrations(&queue).await?;
    Ok(queue)
}
