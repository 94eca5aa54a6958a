//! Configuration loader and validator for the guild mirror.
use crate::cleanup::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub discord: Discord,
    #[serde(default)]
    pub cleanup: Cleanup,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

fn default_sweep_concurrency() -> usize {
    4
}

/// Discord bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discord {
    pub bot_token: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Skips the `users/@me` lookup at startup when set.
    #[serde(default)]
    pub bot_user_id: Option<i64>,
}

/// Feature tables the primary process knows reference mirrored entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cleanup {
    #[serde(default)]
    pub tables: Vec<DeclaredTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredTable {
    pub name: String,
    pub columns: Vec<String>,
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Default SQLite location inside the data directory.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/mirror.db", self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sweep_interval_secs == 0 {
        return Err(invalid("app.sweep_interval_secs must be > 0"));
    }
    if cfg.app.sweep_concurrency == 0 {
        return Err(invalid("app.sweep_concurrency must be > 0"));
    }

    if cfg.discord.bot_token.trim().is_empty() {
        return Err(invalid("discord.bot_token must be non-empty"));
    }
    if let Some(base) = &cfg.discord.api_base {
        if !base.ends_with('/') {
            return Err(invalid("discord.api_base must end with '/'"));
        }
    }

    for table in &cfg.cleanup.tables {
        if !is_valid_identifier(&table.name) {
            return Err(invalid(format!(
                "cleanup.tables: invalid table name {:?}",
                table.name
            )));
        }
        if table.columns.is_empty() {
            return Err(invalid(format!(
                "cleanup.tables.{}.columns must be non-empty",
                table.name
            )));
        }
        if let Some(col) = table.columns.iter().find(|c| !is_valid_identifier(c)) {
            return Err(invalid(format!(
                "cleanup.tables.{}: invalid column name {:?}",
                table.name, col
            )));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sweep_interval_secs: 300
  sweep_concurrency: 4

discord:
  bot_token: "YOUR_DISCORD_BOT_TOKEN"
  api_base: "https://discord.com/api/v10/"

cleanup:
  tables:
    - name: "reward_grants"
      columns: ["user_id", "community_id"]
    - name: "reminders"
      columns: ["user_id", "channel_id"]
"#
}
