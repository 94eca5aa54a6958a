//! Periodic full-diff reconciliation between the platform and the mirror.
//!
//! Runs independently of the event handlers and writes the same rows, so
//! every step is a predicate-based update that converges no matter how it
//! interleaves with events: a second run over unchanged upstream state
//! writes nothing.

use crate::db::Repositories;
use crate::model::{CategoryType, ChannelType, ClientId, NewEntity};
use crate::orchestrator::retire_community;
use crate::platform::PlatformClient;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Counters for one sweep + cleanup cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub communities_reconciled: u64,
    pub communities_created: u64,
    pub communities_skipped: u64,
    pub communities_failed: u64,
    pub communities_retired: u64,
    pub users_removed: u64,
    pub users_added: u64,
    pub channels_removed: u64,
    pub channels_added: u64,
    pub roles_removed: u64,
    pub roles_added: u64,
    pub cleanup_succeeded: u64,
    pub cleanup_failed: u64,
    pub cleanup_deferred: u64,
    /// Targets found live again when their cleanup finished.
    pub cleanup_revived: u64,
}

impl SweepReport {
    /// Rows written by the diff steps of this cycle.
    pub fn rows_written(&self) -> u64 {
        self.communities_created
            + self.communities_retired
            + self.users_removed
            + self.users_added
            + self.channels_removed
            + self.channels_added
            + self.roles_removed
            + self.roles_added
    }

    fn absorb(&mut self, other: &SweepReport) {
        self.communities_reconciled += other.communities_reconciled;
        self.communities_created += other.communities_created;
        self.communities_skipped += other.communities_skipped;
        self.communities_failed += other.communities_failed;
        self.communities_retired += other.communities_retired;
        self.users_removed += other.users_removed;
        self.users_added += other.users_added;
        self.channels_removed += other.channels_removed;
        self.channels_added += other.channels_added;
        self.roles_removed += other.roles_removed;
        self.roles_added += other.roles_added;
        self.cleanup_succeeded += other.cleanup_succeeded;
        self.cleanup_failed += other.cleanup_failed;
        self.cleanup_deferred += other.cleanup_deferred;
        self.cleanup_revived += other.cleanup_revived;
    }
}

/// Live state of one guild, fetched before anything is written.
struct GuildSnapshot {
    members: HashSet<ClientId>,
    channels: Vec<(ClientId, ChannelType)>,
    roles: HashSet<ClientId>,
}

pub struct ReconciliationSweep {
    repos: Repositories,
    platform: Arc<dyn PlatformClient>,
    category_type: CategoryType,
    bot_user_id: ClientId,
    concurrency: usize,
}

impl ReconciliationSweep {
    pub fn new(
        repos: Repositories,
        platform: Arc<dyn PlatformClient>,
        category_type: CategoryType,
        bot_user_id: ClientId,
        concurrency: usize,
    ) -> Self {
        Self {
            repos,
            platform,
            category_type,
            bot_user_id,
            concurrency: concurrency.max(1),
        }
    }

    /// Reconcile every visible guild, then retire communities that are no
    /// longer visible. Per-community failures are counted, never propagated.
    #[instrument(skip_all)]
    pub async fn run(&self, report: &mut SweepReport) -> Result<()> {
        let visible = match self.platform.fetch_guild_ids().await {
            Ok(visible) => visible,
            Err(err) => {
                warn!(?err, "failed to fetch visible guilds; skipping sweep");
                return Ok(());
            }
        };
        // No visible guild at all is treated like a failed fetch: retiring
        // every community on it would be unrecoverable.
        if visible.is_empty() {
            warn!("platform reported no visible guilds; skipping sweep");
            return Ok(());
        }

        let mut guilds: Vec<ClientId> = visible.iter().copied().collect();
        guilds.sort_unstable();
        let outcomes: Vec<SweepReport> = stream::iter(guilds)
            .map(|guild_id| async move {
                let mut local = SweepReport::default();
                if let Err(err) = self.reconcile_community(guild_id, &mut local).await {
                    warn!(?err, guild_id, "community reconciliation failed; skipping this cycle");
                    local.communities_failed += 1;
                }
                local
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for outcome in &outcomes {
            report.absorb(outcome);
        }

        let known: Vec<ClientId> = visible.into_iter().collect();
        self.retire_vanished(&known, report).await
    }

    async fn fetch_snapshot(&self, guild_id: ClientId) -> Result<GuildSnapshot> {
        let (members, channels, roles) = tokio::try_join!(
            self.platform.fetch_guild_members(guild_id),
            self.platform.fetch_guild_channels(guild_id),
            self.platform.fetch_guild_roles(guild_id),
        )
        .with_context(|| format!("fetch snapshot of guild {guild_id}"))?;
        let channels = channels
            .into_iter()
            .filter_map(|c| ChannelType::from_platform(c.tag).map(|t| (c.id, t)))
            .collect();
        Ok(GuildSnapshot {
            members,
            channels,
            roles,
        })
    }

    #[instrument(skip(self, report))]
    async fn reconcile_community(&self, guild_id: ClientId, report: &mut SweepReport) -> Result<()> {
        let snapshot = self.fetch_snapshot(guild_id).await?;

        // An empty live set is a failed fetch, not an empty guild: passing
        // it to the set-difference delete would drop every row.
        if snapshot.members.is_empty() || snapshot.channels.is_empty() || snapshot.roles.is_empty() {
            warn!(
                guild_id,
                members = snapshot.members.len(),
                channels = snapshot.channels.len(),
                roles = snapshot.roles.len(),
                "empty live set; skipping community this cycle"
            );
            report.communities_skipped += 1;
            return Ok(());
        }

        let community_id = self.resolve_or_create(guild_id, report).await?;
        let cat = self.category_type;

        // The bot stays in the keep list but is never mirrored as a user.
        let keep_members: Vec<ClientId> = snapshot.members.iter().copied().collect();
        report.users_removed += self
            .repos
            .users
            .delete_not_belong_by_community_id_and_client_ids(community_id, &keep_members)
            .await?;
        let members: Vec<NewEntity> = keep_members
            .iter()
            .filter(|&&id| id != self.bot_user_id)
            .map(|&id| NewEntity::scoped(cat, id, community_id))
            .collect();
        report.users_added += self.repos.users.bulk_upsert(&members).await?;

        let keep_channels: Vec<ClientId> = snapshot.channels.iter().map(|(id, _)| *id).collect();
        report.channels_removed += self
            .repos
            .channels
            .delete_not_belong_by_community_id_and_client_ids(community_id, &keep_channels)
            .await?;
        let channels: Vec<NewEntity> = snapshot
            .channels
            .iter()
            .map(|&(id, ty)| NewEntity::channel(cat, id, community_id, ty))
            .collect();
        report.channels_added += self.repos.channels.bulk_upsert(&channels).await?;

        let keep_roles: Vec<ClientId> = snapshot.roles.iter().copied().collect();
        report.roles_removed += self
            .repos
            .roles
            .delete_not_belong_by_community_id_and_client_ids(community_id, &keep_roles)
            .await?;
        let roles: Vec<NewEntity> = keep_roles
            .iter()
            .map(|&id| NewEntity::scoped(cat, id, community_id))
            .collect();
        report.roles_added += self.repos.roles.bulk_upsert(&roles).await?;

        report.communities_reconciled += 1;
        debug!(guild_id, community_id, "community reconciled");
        Ok(())
    }

    async fn resolve_or_create(&self, guild_id: ClientId, report: &mut SweepReport) -> Result<i64> {
        let cat = self.category_type;
        if let Some(community) = self.repos.communities.find_by_client_id(cat, guild_id).await? {
            return Ok(community.id);
        }
        let id = match self
            .repos
            .communities
            .create(&NewEntity::community(cat, guild_id))
            .await
        {
            Ok(id) => id,
            Err(err) if err.is_constraint_violation() => self
                .repos
                .communities
                .restore_by_client_id(cat, guild_id)
                .await?
                .with_context(|| format!("community {guild_id} neither creatable nor restorable"))?,
            Err(err) => return Err(err.into()),
        };
        info!(guild_id, community_id = id, "discovered community");
        report.communities_created += 1;
        Ok(id)
    }

    /// Retire communities whose guild is no longer visible.
    #[instrument(skip_all)]
    async fn retire_vanished(&self, visible: &[ClientId], report: &mut SweepReport) -> Result<()> {
        let vanished = self
            .repos
            .communities
            .get_not_exist_client_id(self.category_type, visible)
            .await?;
        for community in vanished {
            match retire_community(&self.repos, community.id).await {
                Ok(teardown) => {
                    info!(
                        community_id = community.id,
                        client_id = community.client_id,
                        users = teardown.users,
                        channels = teardown.channels,
                        roles = teardown.roles,
                        "retired vanished community"
                    );
                    report.communities_retired += teardown.community;
                }
                Err(err) => {
                    warn!(?err, community_id = community.id, "failed to retire community");
                    report.communities_failed += 1;
                }
            }
        }
        Ok(())
    }
}
