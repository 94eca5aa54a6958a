//! External platform adapter: guild snapshots over REST and the lifecycle
//! events delivered by the gateway bridge.

use crate::config::Config;
use crate::model::ClientId;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10/";
const MEMBER_PAGE_LIMIT: usize = 1000;
const GUILD_PAGE_LIMIT: usize = 200;
const MAX_RATE_LIMIT_RETRIES: usize = 3;

/// A guild channel as reported by the platform, with its raw type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuildChannel {
    pub id: ClientId,
    pub tag: u8,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// The bot's own user id.
    async fn current_user_id(&self) -> Result<ClientId>;

    /// Guilds the bot can currently see.
    async fn fetch_guild_ids(&self) -> Result<HashSet<ClientId>>;

    async fn fetch_guild_members(&self, guild_id: ClientId) -> Result<HashSet<ClientId>>;

    async fn fetch_guild_channels(&self, guild_id: ClientId) -> Result<HashSet<GuildChannel>>;

    async fn fetch_guild_roles(&self, guild_id: ClientId) -> Result<HashSet<ClientId>>;
}

/// Discord REST client.
#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for DiscordClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    #[serde(with = "snowflake")]
    id: ClientId,
}

#[derive(Debug, Deserialize)]
struct MemberPayload {
    user: Option<IdPayload>,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    #[serde(with = "snowflake")]
    id: ClientId,
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Debug, Deserialize)]
struct ThreadListPayload {
    threads: Vec<ChannelPayload>,
}

#[derive(Debug, Deserialize)]
struct RateLimitPayload {
    retry_after: f64,
}

impl DiscordClient {
    pub fn new(token: String) -> Result<Self> {
        let base_url = Url::parse(DISCORD_API_BASE).context("invalid default Discord URL")?;
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("guild-mirror/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        match &cfg.discord.api_base {
            Some(base) => {
                let url = Url::parse(base).context("invalid discord.api_base")?;
                Self::with_base_url(cfg.discord.bot_token.clone(), url)
            }
            None => Self::new(cfg.discord.bot_token.clone()),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid Discord path {path}"))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path)?;
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let resp = self
                .http
                .get(url.clone())
                .query(query)
                .header(AUTHORIZATION, format!("Bot {}", self.token))
                .send()
                .await
                .with_context(|| format!("GET {path}"))?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let wait = resp
                    .json::<RateLimitPayload>()
                    .await
                    .map(|p| p.retry_after)
                    .unwrap_or(1.0)
                    .clamp(0.0, 60.0);
                warn!(path, attempt, wait, "rate limited by Discord; retrying");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("GET {path} failed with {status}: {body}"));
            }
            return resp
                .json::<T>()
                .await
                .with_context(|| format!("decode response of GET {path}"));
        }
        Err(anyhow!("GET {path} still rate limited after {MAX_RATE_LIMIT_RETRIES} retries"))
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    async fn current_user_id(&self) -> Result<ClientId> {
        let me: IdPayload = self.get_json("users/@me", &[]).await?;
        Ok(me.id)
    }

    async fn fetch_guild_ids(&self) -> Result<HashSet<ClientId>> {
        let mut ids = HashSet::new();
        let mut after: Option<ClientId> = None;
        loop {
            let mut query = vec![("limit", GUILD_PAGE_LIMIT.to_string())];
            if let Some(after) = after {
                query.push(("after", after.to_string()));
            }
            let page: Vec<IdPayload> = self.get_json("users/@me/guilds", &query).await?;
            let len = page.len();
            after = page.iter().map(|g| g.id).max();
            ids.extend(page.into_iter().map(|g| g.id));
            if len < GUILD_PAGE_LIMIT {
                break;
            }
        }
        debug!(count = ids.len(), "fetched visible guilds");
        Ok(ids)
    }

    async fn fetch_guild_members(&self, guild_id: ClientId) -> Result<HashSet<ClientId>> {
        let path = format!("guilds/{guild_id}/members");
        let mut ids = HashSet::new();
        let mut after: ClientId = 0;
        loop {
            let query = [
                ("limit", MEMBER_PAGE_LIMIT.to_string()),
                ("after", after.to_string()),
            ];
            let page: Vec<MemberPayload> = self.get_json(&path, &query).await?;
            let len = page.len();
            for member in page.into_iter().filter_map(|m| m.user) {
                after = after.max(member.id);
                ids.insert(member.id);
            }
            if len < MEMBER_PAGE_LIMIT {
                break;
            }
        }
        Ok(ids)
    }

    async fn fetch_guild_channels(&self, guild_id: ClientId) -> Result<HashSet<GuildChannel>> {
        let channels: Vec<ChannelPayload> =
            self.get_json(&format!("guilds/{guild_id}/channels"), &[]).await?;
        // Threads are not part of the channel listing.
        let threads: ThreadListPayload = self
            .get_json(&format!("guilds/{guild_id}/threads/active"), &[])
            .await?;
        Ok(channels
            .into_iter()
            .chain(threads.threads)
            .map(|c| GuildChannel {
                id: c.id,
                tag: c.kind,
            })
            .collect())
    }

    async fn fetch_guild_roles(&self, guild_id: ClientId) -> Result<HashSet<ClientId>> {
        let roles: Vec<IdPayload> = self.get_json(&format!("guilds/{guild_id}/roles"), &[]).await?;
        Ok(roles.into_iter().map(|r| r.id).collect())
    }
}

/// Lifecycle events forwarded by the gateway bridge, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    GuildJoined {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
    },
    GuildLeft {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
        /// Set during a platform outage; the bot has not actually left.
        #[serde(default)]
        unavailable: bool,
    },
    MemberJoined {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
        #[serde(with = "snowflake")]
        user_id: ClientId,
    },
    MemberLeft {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
        #[serde(with = "snowflake")]
        user_id: ClientId,
    },
    ChannelCreated {
        #[serde(default, with = "snowflake::option")]
        guild_id: Option<ClientId>,
        #[serde(with = "snowflake")]
        channel_id: ClientId,
        channel_type: u8,
    },
    ChannelDeleted {
        #[serde(default, with = "snowflake::option")]
        guild_id: Option<ClientId>,
        #[serde(with = "snowflake")]
        channel_id: ClientId,
        channel_type: u8,
    },
    RoleCreated {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
        #[serde(with = "snowflake")]
        role_id: ClientId,
    },
    RoleDeleted {
        #[serde(with = "snowflake")]
        guild_id: ClientId,
        #[serde(with = "snowflake")]
        role_id: ClientId,
    },
}

impl PlatformEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformEvent::GuildJoined { .. } => "guild_joined",
            PlatformEvent::GuildLeft { .. } => "guild_left",
            PlatformEvent::MemberJoined { .. } => "member_joined",
            PlatformEvent::MemberLeft { .. } => "member_left",
            PlatformEvent::ChannelCreated { .. } => "channel_created",
            PlatformEvent::ChannelDeleted { .. } => "channel_deleted",
            PlatformEvent::RoleCreated { .. } => "role_created",
            PlatformEvent::RoleDeleted { .. } => "role_deleted",
        }
    }
}

/// Snowflakes travel as JSON strings; numbers are accepted too.
pub mod snowflake {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    fn parse<E: de::Error>(raw: Raw) -> Result<i64, E> {
        match raw {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s
                .parse()
                .map_err(|_| E::custom(format!("invalid snowflake {s:?}"))),
        }
    }

    pub fn serialize<S: Serializer>(id: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        parse(Raw::deserialize(d)?)
    }

    pub mod option {
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(id: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
            match id {
                Some(id) => s.serialize_some(&id.to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
            Option::<Raw>::deserialize(d)?
                .map(parse::<D::Error>)
                .transpose()
        }
    }
}
