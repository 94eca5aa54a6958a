use anyhow::{Context, Result};
use clap::Parser;
use guild_mirror::config;
use guild_mirror::db::{self, Repositories};
use guild_mirror::handlers::SyncHandlers;
use guild_mirror::model::CategoryType;
use guild_mirror::platform::{DiscordClient, PlatformClient, PlatformEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Mirror guild lifecycle events read as JSON lines from stdin"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let platform: Arc<dyn PlatformClient> = Arc::new(DiscordClient::from_config(&cfg)?);
    let bot_user_id = match cfg.discord.bot_user_id {
        Some(id) => id,
        None => platform
            .current_user_id()
            .await
            .context("resolve bot user id")?,
    };
    let handlers = SyncHandlers::new(
        Repositories::new(pool),
        platform,
        CategoryType::Discord,
        bot_user_id,
    );

    info!(bot_user_id, "reading platform events from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read event line")?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };
        let Some(line) = line else {
            info!("event stream closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: PlatformEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(?err, line, "skipping malformed event");
                continue;
            }
        };
        if let Err(err) = handlers.handle_event(&event).await {
            error!(?err, event = event.name(), "failed to handle event");
        }
    }
    Ok(())
}
