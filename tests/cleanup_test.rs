mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::{count, exec, setup_pool};
use guild_mirror::cleanup::{CascadingDeletionResolver, CleanupParticipant, ModelRegistry, SqlTable};
use guild_mirror::config::DeclaredTable;
use guild_mirror::model::{CleanupRequest, ColumnKey};
use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Participant that records every delete and optionally fails.
struct RecordingTable {
    name: String,
    columns: Vec<String>,
    fail: bool,
    deletes: Arc<Mutex<Vec<(String, i64)>>>,
}

impl RecordingTable {
    fn new(name: &str, columns: &[&str], fail: bool) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            fail,
            deletes: Arc::default(),
        }
    }
}

#[async_trait]
impl CleanupParticipant for RecordingTable {
    fn table(&self) -> &str {
        &self.name
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    async fn delete_where(&self, column: &str, id: i64) -> Result<u64> {
        self.deletes.lock().await.push((column.to_string(), id));
        if self.fail {
            return Err(anyhow!("no such table: {}", self.name));
        }
        Ok(1)
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<StdMutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

async fn feature_tables(pool: &sqlx::SqlitePool) {
    exec(
        pool,
        "CREATE TABLE reward_grants (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, amount INTEGER)",
    )
    .await;
    exec(
        pool,
        "CREATE TABLE announcements (id INTEGER PRIMARY KEY, channel_id INTEGER NOT NULL)",
    )
    .await;
    exec(pool, "INSERT INTO reward_grants (user_id, amount) VALUES (42, 1), (42, 2), (43, 3)").await;
    exec(pool, "INSERT INTO announcements (channel_id) VALUES (42)").await;
}

#[tokio::test]
async fn resolver_deletes_only_from_tables_with_matching_column() {
    let pool = setup_pool().await;
    feature_tables(&pool).await;
    let primary = ModelRegistry::new()
        .with(Arc::new(SqlTable::new(pool.clone(), "reward_grants", ["id", "user_id", "amount"]).unwrap()))
        .with(Arc::new(SqlTable::new(pool.clone(), "announcements", ["id", "channel_id"]).unwrap()));
    let resolver = CascadingDeletionResolver::new(primary, ModelRegistry::new());

    let ok = resolver
        .resolve(CleanupRequest {
            key: ColumnKey::User,
            id: 42,
        })
        .await;
    assert!(ok);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reward_grants").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM announcements").await, 1);

    // Running it again finds nothing and still succeeds.
    assert!(
        resolver
            .resolve(CleanupRequest {
                key: ColumnKey::User,
                id: 42,
            })
            .await
    );
}

#[tokio::test]
async fn resolver_succeeds_when_no_table_matches() {
    let pool = setup_pool().await;
    feature_tables(&pool).await;
    let primary = ModelRegistry::declared(
        &pool,
        &[DeclaredTable {
            name: "reward_grants".into(),
            columns: vec!["user_id".into()],
        }],
    )
    .unwrap();
    let resolver = CascadingDeletionResolver::new(primary, ModelRegistry::new());
    assert!(
        resolver
            .resolve(CleanupRequest {
                key: ColumnKey::Role,
                id: 42,
            })
            .await
    );
    assert!(
        CascadingDeletionResolver::default()
            .resolve(CleanupRequest {
                key: ColumnKey::Community,
                id: 1,
            })
            .await
    );
}

#[tokio::test]
async fn resolver_isolates_failures_and_logs_them() {
    let failing = Arc::new(RecordingTable::new("missing_table", &["user_id"], true));
    let healthy = Arc::new(RecordingTable::new("reward_grants", &["user_id"], false));
    let resolver = CascadingDeletionResolver::new(
        ModelRegistry::new().with(failing.clone()),
        ModelRegistry::new().with(healthy.clone()),
    );

    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let ok = resolver
        .resolve(CleanupRequest {
            key: ColumnKey::User,
            id: 42,
        })
        .await;

    assert!(!ok);
    assert!(logs.contents().contains("Error in deleteRecordInRelatedTable"));
    // The failure did not stop the remaining participants.
    assert_eq!(*healthy.deletes.lock().await, vec![("user_id".to_string(), 42)]);
    assert_eq!(failing.deletes.lock().await.len(), 1);
}

#[tokio::test]
async fn resolver_purges_a_table_known_to_both_registries_once() {
    let shared = Arc::new(RecordingTable::new("reward_grants", &["user_id"], false));
    let resolver = CascadingDeletionResolver::new(
        ModelRegistry::new().with(shared.clone()),
        ModelRegistry::new().with(shared.clone()),
    );
    assert!(
        resolver
            .resolve(CleanupRequest {
                key: ColumnKey::User,
                id: 7,
            })
            .await
    );
    assert_eq!(shared.deletes.lock().await.len(), 1);
}

#[tokio::test]
async fn discovered_registry_reflects_live_schema() {
    let pool = setup_pool().await;
    feature_tables(&pool).await;
    let registry = ModelRegistry::discover(&pool).await.unwrap();
    let tables = registry.tables();

    for expected in ["announcements", "channels", "communities", "reward_grants", "roles", "users"] {
        assert!(tables.contains(&expected), "missing {expected}: {tables:?}");
    }
    assert!(!tables.iter().any(|t| t.starts_with("sqlite_") || *t == "_sqlx_migrations"));

    let reward = registry.iter().find(|p| p.table() == "reward_grants").unwrap();
    assert!(reward.has_column("user_id"));
    assert!(!reward.has_column("channel_id"));

    // The scheduler registry alone can resolve a channel cleanup.
    let resolver = CascadingDeletionResolver::new(ModelRegistry::new(), registry);
    assert!(
        resolver
            .resolve(CleanupRequest {
                key: ColumnKey::Channel,
                id: 42,
            })
            .await
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM announcements").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reward_grants").await, 3);
}

#[tokio::test]
async fn community_purge_leaves_live_mirror_rows_alone() {
    let pool = setup_pool().await;
    exec(
        &pool,
        "CREATE TABLE reward_grants (id INTEGER PRIMARY KEY, community_id INTEGER NOT NULL)",
    )
    .await;
    exec(
        &pool,
        "INSERT INTO users (category_type, client_id, community_id, deleted_at) \
         VALUES (0, 1, 7, NULL), (0, 2, 7, CURRENT_TIMESTAMP), (0, 3, 8, CURRENT_TIMESTAMP)",
    )
    .await;
    exec(&pool, "INSERT INTO reward_grants (community_id) VALUES (7), (7), (8)").await;

    let resolver = CascadingDeletionResolver::new(
        ModelRegistry::new(),
        ModelRegistry::discover(&pool).await.unwrap(),
    );
    assert!(
        resolver
            .resolve(CleanupRequest {
                key: ColumnKey::Community,
                id: 7,
            })
            .await
    );
    // Mirror tables only lose soft-deleted rows; feature tables lose all.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users WHERE community_id = 7").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM users WHERE community_id = 7 AND deleted_at IS NULL").await,
        1
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM users WHERE community_id = 8").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reward_grants").await, 1);
}

#[tokio::test]
async fn declared_table_missing_from_schema_reports_failure() {
    let pool = setup_pool().await;
    let primary = ModelRegistry::declared(
        &pool,
        &[DeclaredTable {
            name: "not_migrated_yet".into(),
            columns: vec!["user_id".into()],
        }],
    )
    .unwrap();
    let resolver = CascadingDeletionResolver::new(primary, ModelRegistry::new());
    assert!(
        !resolver
            .resolve(CleanupRequest {
                key: ColumnKey::User,
                id: 1,
            })
            .await
    );
}
