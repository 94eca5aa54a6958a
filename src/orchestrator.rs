//! Community teardown sequencing and the sweep/cleanup cadence.

use crate::cleanup::CascadingDeletionResolver;
use crate::db::{EntityRepository, Mirrored, Repositories};
use crate::error::RepoResult;
use crate::model::{BatchStatus, CleanupRequest, Community};
use crate::sweep::{ReconciliationSweep, SweepReport};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// The steps of removing a community from the mirror, in the order they
/// must run.
#[async_trait]
pub trait CommunityTeardown: Send + Sync {
    async fn delete_users(&self, community_id: i64) -> RepoResult<u64>;
    async fn delete_channels(&self, community_id: i64) -> RepoResult<u64>;
    async fn delete_roles(&self, community_id: i64) -> RepoResult<u64>;
    async fn delete_community(&self, community_id: i64) -> RepoResult<u64>;
}

#[async_trait]
impl CommunityTeardown for Repositories {
    async fn delete_users(&self, community_id: i64) -> RepoResult<u64> {
        self.users.delete_by_community_id(community_id).await
    }

    async fn delete_channels(&self, community_id: i64) -> RepoResult<u64> {
        self.channels.delete_by_community_id(community_id).await
    }

    async fn delete_roles(&self, community_id: i64) -> RepoResult<u64> {
        self.roles.delete_by_community_id(community_id).await
    }

    async fn delete_community(&self, community_id: i64) -> RepoResult<u64> {
        self.communities.delete_by_id(community_id).await
    }
}

/// Rows soft-deleted by one teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub users: u64,
    pub channels: u64,
    pub roles: u64,
    pub community: u64,
}

/// Soft-delete a community's users, channels and roles, then the community.
///
/// Each step commits on its own. If the process dies midway, the children
/// already deleted sit on the cleanup worklist and the community is still
/// live, so the next leave event or sweep finishes the job.
#[instrument(skip(steps))]
pub async fn retire_community(steps: &dyn CommunityTeardown, community_id: i64) -> RepoResult<Teardown> {
    let users = steps.delete_users(community_id).await?;
    let channels = steps.delete_channels(community_id).await?;
    let roles = steps.delete_roles(community_id).await?;
    let community = steps.delete_community(community_id).await?;
    Ok(Teardown {
        users,
        channels,
        roles,
        community,
    })
}

/// Drives reconciliation and cleanup cycles for the scheduler process.
pub struct Orchestrator {
    repos: Repositories,
    sweep: ReconciliationSweep,
    resolver: CascadingDeletionResolver,
    cycle_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        repos: Repositories,
        sweep: ReconciliationSweep,
        resolver: CascadingDeletionResolver,
    ) -> Self {
        Self {
            repos,
            sweep,
            resolver,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// One sweep followed by one cleanup pass. Returns `None` when a cycle
    /// is already running in this process.
    pub async fn run_cycle(&self) -> Result<Option<SweepReport>> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            warn!("previous cycle still running; skipping");
            return Ok(None);
        };
        let cycle = Uuid::new_v4();
        async {
            let mut report = SweepReport::default();
            self.sweep.run(&mut report).await?;
            self.cleanup_pass(&mut report).await?;
            info!(
                reconciled = report.communities_reconciled,
                created = report.communities_created,
                skipped = report.communities_skipped,
                failed = report.communities_failed,
                retired = report.communities_retired,
                rows_written = report.rows_written(),
                cleaned = report.cleanup_succeeded,
                cleanup_failed = report.cleanup_failed,
                deferred = report.cleanup_deferred,
                revived = report.cleanup_revived,
                "sweep cycle finished"
            );
            Ok::<_, anyhow::Error>(Some(report))
        }
        .instrument(info_span!("sweep_cycle", %cycle))
        .await
    }

    /// Purge dependents of every pending deletion target.
    ///
    /// Users, channels and roles go first. A community is only purged once
    /// none of its children are pending: purging it hard-deletes those child
    /// rows, and their own dependents would lose their worklist marker.
    #[instrument(skip_all)]
    pub async fn cleanup_pass(&self, report: &mut SweepReport) -> Result<()> {
        self.cleanup_kind(&self.repos.users, report).await?;
        self.cleanup_kind(&self.repos.channels, report).await?;
        self.cleanup_kind(&self.repos.roles, report).await?;

        let targets = self
            .repos
            .communities
            .find_deletion_targets_by_batch_status_and_deleted_at()
            .await?;
        for community in targets {
            let pending = self.pending_children(community.id).await?;
            if pending > 0 {
                debug!(community_id = community.id, pending, "children still pending; deferring community");
                report.cleanup_deferred += 1;
                continue;
            }
            // The primary process may have revived the community since the
            // worklist was read; purging `community_id` now would drop its
            // live dependents.
            let current = self
                .repos
                .communities
                .find_by_id_with_deleted(community.id)
                .await?;
            if !current.is_some_and(|c| c.deleted_at.is_some() && c.batch_status == BatchStatus::Yet) {
                debug!(community_id = community.id, "community revived; skipping cleanup");
                report.cleanup_revived += 1;
                continue;
            }
            self.finish_target(&self.repos.communities, community.id, report)
                .await;
        }
        Ok(())
    }

    async fn pending_children(&self, community_id: i64) -> Result<i64> {
        Ok(self.repos.users.count_pending_in_community(community_id).await?
            + self.repos.channels.count_pending_in_community(community_id).await?
            + self.repos.roles.count_pending_in_community(community_id).await?)
    }

    async fn cleanup_kind<T>(&self, repo: &EntityRepository<T>, report: &mut SweepReport) -> Result<()>
    where
        T: Mirrored + HasId,
    {
        let targets = repo
            .find_deletion_targets_by_batch_status_and_deleted_at()
            .await?;
        for target in targets {
            self.finish_target(repo, target.id(), report).await;
        }
        Ok(())
    }

    /// Resolve one target and flip it to `Done` on success; anything else
    /// leaves it `Yet` for the next cycle. A target revived while it was
    /// being resolved stays live and `Yet`.
    async fn finish_target<T: Mirrored>(
        &self,
        repo: &EntityRepository<T>,
        id: i64,
        report: &mut SweepReport,
    ) {
        let request = CleanupRequest {
            key: T::KIND.column_key(),
            id,
        };
        if !self.resolver.resolve(request).await {
            report.cleanup_failed += 1;
            return;
        }
        match repo.mark_done(id).await {
            Ok(1) => report.cleanup_succeeded += 1,
            Ok(_) => {
                debug!(table = T::KIND.table(), id, "target revived during cleanup; left live");
                report.cleanup_revived += 1;
            }
            Err(err) => {
                error!(?err, table = T::KIND.table(), id, "failed to mark cleanup done");
                report.cleanup_failed += 1;
            }
        }
    }

    /// Run cycles every `interval` until `shutdown` resolves.
    pub async fn run_forever<F>(&self, interval: Duration, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        error!(?err, "sweep cycle failed");
                    }
                }
            }
        }
    }
}

/// Row types with a surrogate key.
pub trait HasId {
    fn id(&self) -> i64;
}

macro_rules! impl_has_id {
    ($($ty:ty),*) => {
        $(impl HasId for $ty {
            fn id(&self) -> i64 {
                self.id
            }
        })*
    };
}

impl_has_id!(Community, crate::model::User, crate::model::Channel, crate::model::Role);
