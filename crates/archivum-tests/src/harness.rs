//! Test Harness - in-memory reconstruction stacks and scratch directories

use std::path::{Path, PathBuf};
use std::sync::Arc;

use archivum_repl::config::RetrySettings;
use archivum_repl::document::{self, Document};
use archivum_repl::{
    BackupLog, CategoryRegistry, CollectionConfig, GraphReconciler, InMemoryBackupLog, InMemoryLifecycleStore,
    InMemoryOffsetStore, InMemoryPrimaryStore, InMemorySearchIndex, LifecycleStore, LogAction, LogEntry,
    OffsetStore, PrimaryStore, ReconConfig, ReconError, ReconstructionMetrics, ReconstructionRequestItem,
    ReconstructionResponseItem, ReconstructionService, Result, SearchIndex, TenantId,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Tenant owning graph snapshot streams in every harness.
pub const ADMIN_TENANT: TenantId = 1;

/// Scratch directory for tests that touch the filesystem.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> std::io::Result<Self> {
        Ok(Self {
            temp_dir: tempfile::tempdir()?,
            test_name: test_name.to_string(),
        })
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn backup_root(&self) -> PathBuf {
        self.temp_dir.path().join("backup")
    }

    pub fn offset_file(&self) -> PathBuf {
        self.temp_dir.path().join("offsets.json")
    }
}

/// Retry settings with no sleeping between attempts.
pub fn fast_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        first_delay_ms: 0,
        step_delay_ms: 0,
        max_delay_ms: 0,
        jitter: false,
    }
}

/// Two flat categories and the UNIT graph, listed `bulk_size` entries at a time.
pub fn recon_config(bulk_size: usize) -> ReconConfig {
    ReconConfig {
        retry: fast_retry(),
        restore_bulk_size: bulk_size,
        admin_tenant: ADMIN_TENANT,
        graph_overlap_delay_secs: 60,
        collections: vec![
            CollectionConfig::flat("UNIT", "Unit", &["_up", "_us", "_glpd"]),
            CollectionConfig::flat("OBJECTGROUP", "ObjectGroup", &["_up", "_glpd"]),
            CollectionConfig::graph("UNIT_GRAPH", "UNIT"),
        ],
        ..ReconConfig::default()
    }
}

/// Like [`recon_config`], plus a `LOGBOOK` category whose objects are
/// `{metadatas, lifecycle}` envelopes.
pub fn lifecycle_config(bulk_size: usize) -> ReconConfig {
    let mut config = recon_config(bulk_size);
    config
        .collections
        .push(CollectionConfig::flat("LOGBOOK", "Logbook", &[]).with_lifecycles());
    config
}

/// Envelope of a document and its lifecycle, as backed up.
pub fn envelope(metadatas: Value, lifecycle: Value) -> Value {
    json!({ "metadatas": metadatas, "lifecycle": lifecycle })
}

/// JSON object as a document; anything else gives an empty document.
pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

/// A complete in-memory reconstruction stack.
pub struct ReconHarness {
    pub config: ReconConfig,
    pub log: Arc<InMemoryBackupLog>,
    pub offsets: Arc<InMemoryOffsetStore>,
    pub primary: Arc<InMemoryPrimaryStore>,
    pub index: Arc<InMemorySearchIndex>,
    pub lifecycles: Arc<InMemoryLifecycleStore>,
    pub metrics: Arc<ReconstructionMetrics>,
    pub service: ReconstructionService,
    pub reconciler: GraphReconciler,
}

impl ReconHarness {
    pub fn new() -> Result<Self> {
        Self::with_config(recon_config(1000))
    }

    pub fn with_config(config: ReconConfig) -> Result<Self> {
        Self::with_log(config, Arc::new(InMemoryBackupLog::new()))
    }

    /// Build a stack reading `log`, so that several stacks can share one log.
    pub fn with_log(config: ReconConfig, log: Arc<InMemoryBackupLog>) -> Result<Self> {
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let primary = Arc::new(InMemoryPrimaryStore::new());
        let index = Arc::new(InMemorySearchIndex::new());
        let lifecycles = Arc::new(InMemoryLifecycleStore::new());
        let metrics = Arc::new(ReconstructionMetrics::new());
        let registry = Arc::new(CategoryRegistry::build_with_lifecycles(
            &config.collections,
            primary.clone() as Arc<dyn PrimaryStore>,
            index.clone() as Arc<dyn SearchIndex>,
            Some(lifecycles.clone() as Arc<dyn LifecycleStore>),
        )?);

        let service = ReconstructionService::new(
            &config,
            registry.clone(),
            log.clone() as Arc<dyn BackupLog>,
            offsets.clone() as Arc<dyn OffsetStore>,
        )
        .with_metrics(metrics.clone());
        let reconciler =
            GraphReconciler::new(&config, registry, log.clone() as Arc<dyn BackupLog>).with_metrics(metrics.clone());

        Ok(Self {
            config,
            log,
            offsets,
            primary,
            index,
            lifecycles,
            metrics,
            service,
            reconciler,
        })
    }

    /// Log a write of `body`, named after its `_id` (or its envelope's).
    pub async fn write(&self, tenant: TenantId, category: &str, body: Value) -> Result<LogEntry> {
        let id = body
            .get(document::METADATAS)
            .unwrap_or(&body)
            .get(document::ID)
            .and_then(Value::as_str)
            .ok_or_else(|| ReconError::InvalidRequest {
                msg: "document without _id".to_string(),
            })?
            .to_string();
        self.log
            .append(tenant, category, &format!("{}.json", id), LogAction::Write, Bytes::from(body.to_string()))
            .await
    }

    /// Log the deletion of document `id`.
    pub async fn delete(&self, tenant: TenantId, category: &str, id: &str) -> Result<LogEntry> {
        self.log
            .append(tenant, category, &format!("{}.json", id), LogAction::Delete, Bytes::new())
            .await
    }

    pub async fn run(&self, items: &[ReconstructionRequestItem]) -> Vec<ReconstructionResponseItem> {
        self.service.reconstruct(items).await
    }

    /// Reconstruct a single pair from its stored offset.
    pub async fn run_one(&self, category: &str, tenant: TenantId, limit: u32) -> Option<ReconstructionResponseItem> {
        self.run(&[ReconstructionRequestItem::new(category, tenant, limit)])
            .await
            .into_iter()
            .next()
    }

    pub async fn offset(&self, tenant: TenantId, category: &str) -> Result<u64> {
        self.offsets.find_offset(tenant, category).await
    }

    pub fn unit(&self, tenant: TenantId, id: &str) -> Option<Document> {
        self.primary.get("Unit", Some(tenant), id)
    }

    /// Unit created by a graph merge and not yet claimed by any tenant.
    pub fn graph_only_unit(&self, id: &str) -> Option<Document> {
        self.primary.get("Unit", None, id)
    }

    pub fn indexed_unit(&self, tenant: TenantId, id: &str) -> Option<Document> {
        self.index.get("Unit", tenant, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_paths() {
        let env = TestEnv::new("paths").unwrap();
        assert_eq!(env.test_name(), "paths");
        assert!(env.tempdir().exists());
        assert!(env.backup_root().starts_with(env.tempdir()));
        assert_ne!(env.backup_root(), env.offset_file());
    }

    #[tokio::test]
    async fn test_harness_write_requires_id() {
        let h = ReconHarness::new().unwrap();
        let entry = h.write(0, "UNIT", json!({"_id": "u1"})).await.unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.file_name, "u1.json");
        assert!(h.write(0, "UNIT", json!({"title": "x"})).await.is_err());
        let entry = h
            .write(0, "LOGBOOK", envelope(json!({"_id": "l1"}), json!({"events": []})))
            .await
            .unwrap();
        assert_eq!(entry.file_name, "l1.json");
    }

    #[test]
    fn test_doc_of_non_object_is_empty() {
        assert!(doc(json!([1, 2])).is_empty());
        assert_eq!(doc(json!({"_id": "a"})).len(), 1);
    }
}
