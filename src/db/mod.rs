//! Database module: pool setup and the mirrored-entity repositories.
//!
//! - `repo`: `EntityRepository<T>`, one typed repository per entity kind.
//!
//! Both the primary process and the scheduler open the same SQLite file, so
//! the pool runs in WAL mode with a busy timeout instead of failing fast on
//! a locked database.

pub mod repo;

pub use repo::{EntityRepository, Mirrored, Scoped};

use crate::model::{Channel, Community, Role, User};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let opts = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return Ok(url.to_string());
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return Ok(url.to_string());
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("create database directory {}", parent.display())
            })?;
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    Ok(rebuilt)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// One repository per mirrored entity kind, sharing a pool.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub communities: EntityRepository<Community>,
    pub users: EntityRepository<User>,
    pub channels: EntityRepository<Channel>,
    pub roles: EntityRepository<Role>,
}

impl Repositories {
    pub fn new(pool: Pool) -> Self {
        Self {
            communities: EntityRepository::new(pool.clone()),
            users: EntityRepository::new(pool.clone()),
            channels: EntityRepository::new(pool.clone()),
            roles: EntityRepository::new(pool),
        }
    }
}
