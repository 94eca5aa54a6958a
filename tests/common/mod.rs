#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use guild_mirror::platform::{GuildChannel, PlatformClient};
use guild_mirror::model::ClientId;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const BOT: ClientId = 999;

/// Single-connection in-memory database: every connection to
/// `sqlite::memory:` is a separate database.
pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await.unwrap()
}

#[derive(Clone, Default)]
pub struct FakeGuild {
    pub members: HashSet<ClientId>,
    pub channels: HashSet<GuildChannel>,
    pub roles: HashSet<ClientId>,
}

#[derive(Default)]
struct FakeState {
    guilds: BTreeMap<ClientId, FakeGuild>,
    failing: HashSet<ClientId>,
}

/// In-memory platform whose guild state tests mutate between calls.
#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakePlatform {
    pub async fn add_guild(
        &self,
        guild_id: ClientId,
        members: &[ClientId],
        channels: &[(ClientId, u8)],
        roles: &[ClientId],
    ) {
        let guild = FakeGuild {
            members: members.iter().copied().collect(),
            channels: channels
                .iter()
                .map(|&(id, tag)| GuildChannel { id, tag })
                .collect(),
            roles: roles.iter().copied().collect(),
        };
        self.state.lock().await.guilds.insert(guild_id, guild);
    }

    pub async fn set_members(&self, guild_id: ClientId, members: &[ClientId]) {
        let mut state = self.state.lock().await;
        if let Some(guild) = state.guilds.get_mut(&guild_id) {
            guild.members = members.iter().copied().collect();
        }
    }

    pub async fn set_channels(&self, guild_id: ClientId, channels: &[(ClientId, u8)]) {
        let mut state = self.state.lock().await;
        if let Some(guild) = state.guilds.get_mut(&guild_id) {
            guild.channels = channels
                .iter()
                .map(|&(id, tag)| GuildChannel { id, tag })
                .collect();
        }
    }

    pub async fn set_roles(&self, guild_id: ClientId, roles: &[ClientId]) {
        let mut state = self.state.lock().await;
        if let Some(guild) = state.guilds.get_mut(&guild_id) {
            guild.roles = roles.iter().copied().collect();
        }
    }

    pub async fn remove_guild(&self, guild_id: ClientId) {
        self.state.lock().await.guilds.remove(&guild_id);
    }

    /// Every fetch for `guild_id` fails until further notice.
    pub async fn fail_guild(&self, guild_id: ClientId) {
        self.state.lock().await.failing.insert(guild_id);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn guild(&self, call: &str, guild_id: ClientId) -> Result<FakeGuild> {
        self.calls.lock().await.push(format!("{call}:{guild_id}"));
        let state = self.state.lock().await;
        if state.failing.contains(&guild_id) {
            return Err(anyhow!("guild {guild_id} unavailable"));
        }
        state
            .guilds
            .get(&guild_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown guild {guild_id}"))
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn current_user_id(&self) -> Result<ClientId> {
        Ok(BOT)
    }

    async fn fetch_guild_ids(&self) -> Result<HashSet<ClientId>> {
        self.calls.lock().await.push("guilds".into());
        Ok(self.state.lock().await.guilds.keys().copied().collect())
    }

    async fn fetch_guild_members(&self, guild_id: ClientId) -> Result<HashSet<ClientId>> {
        Ok(self.guild("members", guild_id).await?.members)
    }

    async fn fetch_guild_channels(&self, guild_id: ClientId) -> Result<HashSet<GuildChannel>> {
        Ok(self.guild("channels", guild_id).await?.channels)
    }

    async fn fetch_guild_roles(&self, guild_id: ClientId) -> Result<HashSet<ClientId>> {
        Ok(self.guild("roles", guild_id).await?.roles)
    }
}
