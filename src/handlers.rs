//! Event-driven incremental sync: each platform event becomes a handful of
//! single-row repository calls.

use crate::db::{EntityRepository, Repositories, Scoped};
use crate::model::{CategoryType, ChannelType, ClientId, NewEntity};
use crate::orchestrator::retire_community;
use crate::platform::{PlatformClient, PlatformEvent};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct SyncHandlers {
    repos: Repositories,
    platform: Arc<dyn PlatformClient>,
    category_type: CategoryType,
    bot_user_id: ClientId,
}

impl SyncHandlers {
    pub fn new(
        repos: Repositories,
        platform: Arc<dyn PlatformClient>,
        category_type: CategoryType,
        bot_user_id: ClientId,
    ) -> Self {
        Self {
            repos,
            platform,
            category_type,
            bot_user_id,
        }
    }

    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn handle_event(&self, event: &PlatformEvent) -> Result<()> {
        match *event {
            PlatformEvent::GuildJoined { guild_id } => self.on_community_join(guild_id).await,
            PlatformEvent::GuildLeft {
                guild_id,
                unavailable,
            } => {
                if unavailable {
                    debug!(guild_id, "guild unavailable; not treating as a leave");
                    return Ok(());
                }
                self.on_community_leave(guild_id).await
            }
            PlatformEvent::MemberJoined { guild_id, user_id } => {
                self.on_member_join(guild_id, user_id).await
            }
            PlatformEvent::MemberLeft { guild_id, user_id } => {
                self.on_member_leave(guild_id, user_id).await
            }
            PlatformEvent::ChannelCreated {
                guild_id,
                channel_id,
                channel_type,
            } => self.on_channel_create(guild_id, channel_id, channel_type).await,
            PlatformEvent::ChannelDeleted {
                guild_id,
                channel_id,
                channel_type,
            } => self.on_channel_delete(guild_id, channel_id, channel_type).await,
            PlatformEvent::RoleCreated { guild_id, role_id } => {
                self.on_role_create(guild_id, role_id).await
            }
            PlatformEvent::RoleDeleted { guild_id, role_id } => {
                self.on_role_delete(guild_id, role_id).await
            }
        }
    }

    async fn resolve_community(&self, guild_id: ClientId) -> Result<Option<i64>> {
        let community = self
            .repos
            .communities
            .find_by_client_id(self.category_type, guild_id)
            .await?;
        Ok(community.map(|c| c.id))
    }

    /// Mirror a newly joined guild together with its current members,
    /// channels and roles.
    #[instrument(skip(self))]
    pub async fn on_community_join(&self, guild_id: ClientId) -> Result<()> {
        if self.resolve_community(guild_id).await?.is_some() {
            debug!(guild_id, "community already mirrored");
            return Ok(());
        }
        let cat = self.category_type;
        // A guild the bot left earlier still has its soft-deleted row; the
        // unique index makes reviving it the only way back.
        let (community_id, restored) = match self
            .repos
            .communities
            .create(&NewEntity::community(cat, guild_id))
            .await
        {
            Ok(id) => (id, false),
            Err(err) if err.is_constraint_violation() => {
                match self.repos.communities.restore_by_client_id(cat, guild_id).await {
                    Ok(Some(id)) => (id, true),
                    Ok(None) => {
                        warn!(guild_id, "community creation raced another writer; skipping seed");
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(?err, guild_id, "failed to restore community; skipping seed");
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                warn!(?err, guild_id, "failed to create community; skipping seed");
                return Ok(());
            }
        };

        let (members, channels, roles) = tokio::try_join!(
            self.platform.fetch_guild_members(guild_id),
            self.platform.fetch_guild_channels(guild_id),
            self.platform.fetch_guild_roles(guild_id),
        )
        .with_context(|| format!("fetch initial state of guild {guild_id}"))?;

        let users: Vec<NewEntity> = members
            .into_iter()
            .filter(|&id| id != self.bot_user_id)
            .map(|id| NewEntity::scoped(cat, id, community_id))
            .collect();
        let channels: Vec<NewEntity> = channels
            .into_iter()
            .filter_map(|c| {
                ChannelType::from_platform(c.tag)
                    .map(|ty| NewEntity::channel(cat, c.id, community_id, ty))
            })
            .collect();
        let roles: Vec<NewEntity> = roles
            .into_iter()
            .map(|id| NewEntity::scoped(cat, id, community_id))
            .collect();

        // Restored communities still carry their old child rows.
        let (users_n, channels_n, roles_n) = if restored {
            (
                self.repos.users.bulk_upsert(&users).await?,
                self.repos.channels.bulk_upsert(&channels).await?,
                self.repos.roles.bulk_upsert(&roles).await?,
            )
        } else {
            (
                self.repos.users.bulk_create(&users).await?,
                self.repos.channels.bulk_create(&channels).await?,
                self.repos.roles.bulk_create(&roles).await?,
            )
        };
        info!(
            guild_id,
            community_id,
            restored,
            users = users_n,
            channels = channels_n,
            roles = roles_n,
            "community joined"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn on_community_leave(&self, guild_id: ClientId) -> Result<()> {
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            debug!(guild_id, "leave for unknown community");
            return Ok(());
        };
        let teardown = retire_community(&self.repos, community_id).await?;
        info!(
            guild_id,
            community_id,
            users = teardown.users,
            channels = teardown.channels,
            roles = teardown.roles,
            "community left"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn on_member_join(&self, guild_id: ClientId, user_id: ClientId) -> Result<()> {
        if user_id == self.bot_user_id {
            return Ok(());
        }
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        let dto = NewEntity::scoped(self.category_type, user_id, community_id);
        create_or_restore(&self.repos.users, &dto, community_id).await
    }

    #[instrument(skip(self))]
    pub async fn on_member_leave(&self, guild_id: ClientId, user_id: ClientId) -> Result<()> {
        if user_id == self.bot_user_id {
            return Ok(());
        }
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        self.repos
            .users
            .delete_by_community_id_and_client_id(community_id, user_id)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn on_channel_create(
        &self,
        guild_id: Option<ClientId>,
        channel_id: ClientId,
        tag: u8,
    ) -> Result<()> {
        let (Some(guild_id), Some(channel_type)) = (guild_id, ChannelType::from_platform(tag)) else {
            debug!(channel_id, tag, "ignoring non-guild channel");
            return Ok(());
        };
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        let dto = NewEntity::channel(self.category_type, channel_id, community_id, channel_type);
        create_or_restore(&self.repos.channels, &dto, community_id).await
    }

    #[instrument(skip(self))]
    pub async fn on_channel_delete(
        &self,
        guild_id: Option<ClientId>,
        channel_id: ClientId,
        tag: u8,
    ) -> Result<()> {
        let Some(guild_id) = guild_id.filter(|_| ChannelType::from_platform(tag).is_some()) else {
            debug!(channel_id, tag, "ignoring non-guild channel");
            return Ok(());
        };
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        self.repos
            .channels
            .delete_by_community_id_and_client_id(community_id, channel_id)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn on_role_create(&self, guild_id: ClientId, role_id: ClientId) -> Result<()> {
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        let dto = NewEntity::scoped(self.category_type, role_id, community_id);
        create_or_restore(&self.repos.roles, &dto, community_id).await
    }

    #[instrument(skip(self))]
    pub async fn on_role_delete(&self, guild_id: ClientId, role_id: ClientId) -> Result<()> {
        let Some(community_id) = self.resolve_community(guild_id).await? else {
            return Ok(());
        };
        self.repos
            .roles
            .delete_by_community_id_and_client_id(community_id, role_id)
            .await?;
        Ok(())
    }
}

/// Insert a scoped row; a duplicate key means the row exists, live or
/// soft-deleted, and a soft-deleted one is revived.
async fn create_or_restore<T: Scoped>(
    repo: &EntityRepository<T>,
    dto: &NewEntity,
    community_id: i64,
) -> Result<()> {
    match repo.create(dto).await {
        Ok(id) => {
            debug!(id, client_id = dto.client_id, community_id, "row created");
            Ok(())
        }
        Err(err) if err.is_constraint_violation() => {
            let restored = repo
                .restore_by_community_id_and_client_id(community_id, dto.client_id)
                .await?;
            debug!(client_id = dto.client_id, community_id, restored, "row already present");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
