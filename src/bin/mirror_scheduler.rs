use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use guild_mirror::cleanup::{CascadingDeletionResolver, ModelRegistry};
use guild_mirror::config;
use guild_mirror::db::{self, Repositories};
use guild_mirror::model::{CategoryType, EntityKind};
use guild_mirror::orchestrator::Orchestrator;
use guild_mirror::platform::{DiscordClient, PlatformClient};
use guild_mirror::sweep::ReconciliationSweep;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Reconcile mirrored guilds and purge dependents of deleted entities"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single sweep + cleanup cycle and exit
    #[arg(long)]
    once: bool,

    /// Put a row back on the cleanup worklist before running, e.g. `user:42`
    #[arg(long, value_name = "KIND:ID")]
    requeue: Vec<String>,
}

fn parse_requeue(arg: &str) -> Result<(EntityKind, i64)> {
    let (kind, id) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected KIND:ID, got {arg:?}"))?;
    let kind = EntityKind::parse(kind).ok_or_else(|| anyhow!("unknown entity kind {kind:?}"))?;
    let id = id.parse().with_context(|| format!("invalid id in {arg:?}"))?;
    Ok((kind, id))
}

async fn requeue(repos: &Repositories, kind: EntityKind, id: i64) -> Result<u64> {
    let updated = match kind {
        EntityKind::Community => repos.communities.update_batch_status(id).await?,
        EntityKind::User => repos.users.update_batch_status(id).await?,
        EntityKind::Channel => repos.channels.update_batch_status(id).await?,
        EntityKind::Role => repos.roles.update_batch_status(id).await?,
    };
    Ok(updated)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let requeues = args
        .requeue
        .iter()
        .map(|a| parse_requeue(a))
        .collect::<Result<Vec<_>>>()?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let repos = Repositories::new(pool.clone());

    for (kind, id) in requeues {
        match requeue(&repos, kind, id).await? {
            0 => warn!(kind = kind.table(), id, "no row to requeue"),
            _ => info!(kind = kind.table(), id, "requeued for cleanup"),
        }
    }

    let primary = ModelRegistry::declared(&pool, &cfg.cleanup.tables)?;
    let scheduler = ModelRegistry::discover(&pool).await?;
    info!(primary = ?primary, scheduler = scheduler.len(), "cleanup registries loaded");
    let resolver = CascadingDeletionResolver::new(primary, scheduler);

    let platform: Arc<dyn PlatformClient> = Arc::new(DiscordClient::from_config(&cfg)?);
    let bot_user_id = match cfg.discord.bot_user_id {
        Some(id) => id,
        None => platform
            .current_user_id()
            .await
            .context("resolve bot user id")?,
    };
    let sweep = ReconciliationSweep::new(
        repos.clone(),
        platform,
        CategoryType::Discord,
        bot_user_id,
        cfg.app.sweep_concurrency,
    );
    let orchestrator = Orchestrator::new(repos, sweep, resolver);

    if args.once {
        if let Some(report) = orchestrator.run_cycle().await? {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    let interval = Duration::from_secs(cfg.app.sweep_interval_secs);
    info!(interval_secs = cfg.app.sweep_interval_secs, "starting scheduler");
    orchestrator
        .run_forever(interval, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
