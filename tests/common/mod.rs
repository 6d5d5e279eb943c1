//! Shared helpers for integration tests.

use replication_registry::{
    EngineConfig, Registry, RegistryStore, Replicator, StaticReplicator,
};
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

/// A store on a fresh temporary database, plus a raw pool on the same file
/// for fixture surgery (backdating timestamps, forcing counters).
pub struct TestHarness {
    pub store: RegistryStore,
    pub raw: SqlitePool,
    _dir: TempDir,
}

pub async fn harness() -> TestHarness {
    let config = EngineConfig::for_testing();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registries.db");
    let store = RegistryStore::open(&path, config).await.unwrap();
    let raw = SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();

    TestHarness {
        store,
        raw,
        _dir: dir,
    }
}

impl TestHarness {
    /// Drive a row through a successful sync so verification can run.
    pub async fn synced(&self, model_record_id: i64) -> Registry {
        self.synced_with(model_record_id, &StaticReplicator::ready())
            .await
    }

    pub async fn synced_with(
        &self,
        model_record_id: i64,
        replicator: &dyn Replicator,
    ) -> Registry {
        let mut registry = self.store.ensure(model_record_id).await.unwrap();
        assert!(self.store.start_sync(&mut registry).await.unwrap());
        assert!(self
            .store
            .mark_synced(&mut registry, replicator)
            .await
            .unwrap());
        registry
    }

    /// Shift a millisecond timestamp column into the past.
    pub async fn backdate(&self, id: i64, column: &str, by_ms: i64) {
        let sql = format!(
            "UPDATE registries SET {col} = {col} - ? WHERE id = ?",
            col = column
        );
        sqlx::query(&sql)
            .bind(by_ms)
            .bind(id)
            .execute(&self.raw)
            .await
            .unwrap();
    }

    /// Force a retry counter to an arbitrary value.
    pub async fn set_column(&self, id: i64, column: &str, value: i64) {
        let sql = format!("UPDATE registries SET {} = ? WHERE id = ?", column);
        sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .execute(&self.raw)
            .await
            .unwrap();
    }
}
