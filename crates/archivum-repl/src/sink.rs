//! Reconstruction targets: the primary document store and the search index.
//!
//! Both are external collaborators; every operation must be idempotent under
//! redelivery because reconstruction replays entries after partial failures.
//! The in-memory implementations below are used by tests and by embedders
//! that do not have a real driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::document::{self, Document, ID, TENANT};
use crate::error::{ReconError, Result};
use crate::TenantId;

/// Primary document store, addressed by (collection, tenant, `_id`).
///
/// Graph-only documents, created by graph merges before any flat data is
/// known, have no owning tenant. The first tenant writing a document with
/// the same `_id` adopts it: `find` falls back to it and `replace` moves it
/// under that tenant.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Current document of `tenant`, else the graph-only document with that `_id`.
    async fn find(&self, collection: &str, tenant: TenantId, id: &str) -> Result<Option<Document>>;

    /// Replace (or insert) the whole document of `tenant`.
    ///
    /// `expected_glpd` is an optimistic guard: the live document's `_glpd`
    /// (or its absence) must equal it, else [`ReconError::Conflict`].
    async fn replace(
        &self,
        collection: &str,
        tenant: TenantId,
        doc: Document,
        expected_glpd: Option<String>,
    ) -> Result<()>;

    /// `$set` the given fields on the document owned by `owner`, creating it
    /// if absent. Returns the document as stored after the merge.
    async fn merge_graph(
        &self,
        collection: &str,
        owner: Option<TenantId>,
        id: &str,
        fields: Document,
    ) -> Result<Document>;

    /// Delete the document of `tenant`. Deleting an absent document succeeds.
    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()>;

    /// Documents of every tenant whose `_glpd` lies in `[start, end)`, ordered by `_id`.
    async fn find_graph_updated(&self, collection: &str, start: &str, end: &str) -> Result<Vec<Document>>;

    /// Delete documents without `_tenant` whose `_glpd` is older than `older_than`.
    async fn purge_graph_only(&self, collection: &str, older_than: &str) -> Result<u64>;
}

/// Search index, addressed by (collection, tenant, `_id`).
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index or re-index a document of `tenant`.
    async fn upsert(&self, collection: &str, tenant: TenantId, doc: Document) -> Result<()>;

    /// Remove a document of `tenant`. Removing an absent document succeeds.
    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()>;
}

/// Lifecycle journal of documents, addressed by (collection, tenant, `_id`).
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Store the raw lifecycle of a document, replacing any previous one.
    async fn upsert(&self, collection: &str, tenant: TenantId, id: &str, lifecycle: Document) -> Result<()>;

    /// Remove the lifecycle of a document. Removing an absent one succeeds.
    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()>;
}

/// Operation counters of an in-memory sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStats {
    /// Successful writes (replace, merge or upsert).
    pub writes: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Calls rejected by injected faults.
    pub injected_failures: u64,
}

#[derive(Debug, Default)]
struct Faults {
    transient: u32,
    conflicts: u32,
    latency: Duration,
}

type DocKey = (Option<TenantId>, String);
type Collections = HashMap<String, BTreeMap<DocKey, Document>>;

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|e| ReconError::transient(format!("sink state poisoned: {}", e)))
}

fn require_id(doc: &Document) -> Result<String> {
    document::doc_id(doc)
        .map(str::to_string)
        .ok_or_else(|| ReconError::InvalidRequest {
            msg: "document without string _id".to_string(),
        })
}

fn key(tenant: Option<TenantId>, id: &str) -> DocKey {
    (tenant, id.to_string())
}

fn owned_or_graph_only<'a>(docs: &'a BTreeMap<DocKey, Document>, tenant: TenantId, id: &str) -> Option<&'a Document> {
    docs.get(&key(Some(tenant), id)).or_else(|| docs.get(&key(None, id)))
}

/// Fault state shared by the in-memory sinks.
#[derive(Debug, Default)]
struct FaultInjector {
    faults: Mutex<Faults>,
    stats: Mutex<SinkStats>,
}

impl FaultInjector {
    fn set(&self, update: impl FnOnce(&mut Faults)) {
        if let Ok(mut f) = self.faults.lock() {
            update(&mut *f);
        }
    }

    /// Sleep for the configured latency, then fail if a transient fault is armed.
    async fn enter(&self, unavailable: &str) -> Result<()> {
        let latency = guard(&self.faults)?.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut faults = guard(&self.faults)?;
        if faults.transient > 0 {
            faults.transient -= 1;
            drop(faults);
            guard(&self.stats)?.injected_failures += 1;
            return Err(ReconError::transient(unavailable));
        }
        Ok(())
    }

    fn take_conflict(&self) -> Result<bool> {
        let mut faults = guard(&self.faults)?;
        if faults.conflicts > 0 {
            faults.conflicts -= 1;
            drop(faults);
            guard(&self.stats)?.injected_failures += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn count(&self, update: impl FnOnce(&mut SinkStats)) -> Result<()> {
        update(&mut *guard(&self.stats)?);
        Ok(())
    }

    fn stats(&self) -> SinkStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// In-memory primary store with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryPrimaryStore {
    collections: Mutex<Collections>,
    faults: FaultInjector,
}

impl InMemoryPrimaryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.set(|f| f.transient = n);
    }

    /// The next `n` guarded replaces report a conflict.
    pub fn conflict_next(&self, n: u32) {
        self.faults.set(|f| f.conflicts = n);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.set(|f| f.latency = latency);
    }

    /// Insert a document directly, bypassing faults and guards. It is owned
    /// by its `_tenant`, or by no tenant when the field is absent.
    pub fn seed(&self, collection: &str, doc: Document) {
        if let (Ok(mut cols), Some(id)) = (self.collections.lock(), document::doc_id(&doc)) {
            let owner = document::doc_tenant(&doc);
            cols.entry(collection.to_string())
                .or_default()
                .insert(key(owner, id), doc);
        }
    }

    /// Snapshot of a document; `None` as tenant addresses graph-only documents.
    pub fn get(&self, collection: &str, tenant: Option<TenantId>, id: &str) -> Option<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).and_then(|docs| docs.get(&key(tenant, id)).cloned()))
    }

    /// Snapshot of a whole collection, ordered by (tenant, `_id`).
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).map(|docs| docs.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Documents owned by `tenant`, ordered by `_id`.
    pub fn tenant_documents(&self, collection: &str, tenant: TenantId) -> Vec<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| {
                c.get(collection).map(|docs| {
                    docs.iter()
                        .filter(|((owner, _), _)| *owner == Some(tenant))
                        .map(|(_, d)| d.clone())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// Operation counters.
    pub fn stats(&self) -> SinkStats {
        self.faults.stats()
    }
}

#[async_trait]
impl PrimaryStore for InMemoryPrimaryStore {
    async fn find(&self, collection: &str, tenant: TenantId, id: &str) -> Result<Option<Document>> {
        self.faults.enter("primary store unavailable").await?;
        let cols = guard(&self.collections)?;
        Ok(cols
            .get(collection)
            .and_then(|docs| owned_or_graph_only(docs, tenant, id).cloned()))
    }

    async fn replace(
        &self,
        collection: &str,
        tenant: TenantId,
        doc: Document,
        expected_glpd: Option<String>,
    ) -> Result<()> {
        self.faults.enter("primary store unavailable").await?;
        let id = require_id(&doc)?;
        if self.faults.take_conflict()? {
            return Err(ReconError::Conflict { id });
        }
        let mut cols = guard(&self.collections)?;
        let docs = cols.entry(collection.to_string()).or_default();
        let live_glpd = owned_or_graph_only(docs, tenant, &id).and_then(document::graph_stamp);
        if live_glpd != expected_glpd {
            return Err(ReconError::Conflict { id });
        }
        docs.remove(&key(None, &id));
        docs.insert(key(Some(tenant), &id), doc);
        drop(cols);
        self.faults.count(|s| s.writes += 1)
    }

    async fn merge_graph(
        &self,
        collection: &str,
        owner: Option<TenantId>,
        id: &str,
        fields: Document,
    ) -> Result<Document> {
        self.faults.enter("primary store unavailable").await?;
        let mut cols = guard(&self.collections)?;
        let docs = cols.entry(collection.to_string()).or_default();
        let target = docs.entry(key(owner, id)).or_insert_with(|| {
            let mut fresh = Document::new();
            fresh.insert(ID.to_string(), Value::String(id.to_string()));
            fresh
        });
        document::merge_fields(target, &fields);
        let merged = target.clone();
        drop(cols);
        self.faults.count(|s| s.writes += 1)?;
        Ok(merged)
    }

    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()> {
        self.faults.enter("primary store unavailable").await?;
        let mut cols = guard(&self.collections)?;
        if let Some(docs) = cols.get_mut(collection) {
            docs.remove(&key(Some(tenant), id));
        }
        drop(cols);
        self.faults.count(|s| s.deletes += 1)
    }

    async fn find_graph_updated(&self, collection: &str, start: &str, end: &str) -> Result<Vec<Document>> {
        self.faults.enter("primary store unavailable").await?;
        let cols = guard(&self.collections)?;
        let mut found: Vec<Document> = cols
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| {
                        document::graph_stamp(d)
                            .map_or(false, |glpd| glpd.as_str() >= start && glpd.as_str() < end)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| document::doc_id(a).cmp(&document::doc_id(b)));
        Ok(found)
    }

    async fn purge_graph_only(&self, collection: &str, older_than: &str) -> Result<u64> {
        self.faults.enter("primary store unavailable").await?;
        let mut cols = guard(&self.collections)?;
        let Some(docs) = cols.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| {
            let graph_only = !d.contains_key(TENANT);
            let stale = document::graph_stamp(d).map_or(false, |glpd| glpd.as_str() <= older_than);
            !(graph_only && stale)
        });
        let purged = (before - docs.len()) as u64;
        drop(cols);
        self.faults.count(|s| s.deletes += purged)?;
        debug!(collection, purged, "purged graph-only documents");
        Ok(purged)
    }
}

/// In-memory search index with fault injection.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    collections: Mutex<Collections>,
    faults: FaultInjector,
}

impl InMemorySearchIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.set(|f| f.transient = n);
    }

    /// Snapshot of an indexed document of `tenant`.
    pub fn get(&self, collection: &str, tenant: TenantId, id: &str) -> Option<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).and_then(|docs| docs.get(&key(Some(tenant), id)).cloned()))
    }

    /// Number of indexed documents in a collection, all tenants.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// True when the collection holds no indexed document.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Operation counters.
    pub fn stats(&self) -> SinkStats {
        self.faults.stats()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, collection: &str, tenant: TenantId, doc: Document) -> Result<()> {
        self.faults.enter("search index unavailable").await?;
        let id = require_id(&doc)?;
        guard(&self.collections)?
            .entry(collection.to_string())
            .or_default()
            .insert(key(Some(tenant), &id), doc);
        self.faults.count(|s| s.writes += 1)
    }

    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()> {
        self.faults.enter("search index unavailable").await?;
        if let Some(docs) = guard(&self.collections)?.get_mut(collection) {
            docs.remove(&key(Some(tenant), id));
        }
        self.faults.count(|s| s.deletes += 1)
    }
}

/// In-memory lifecycle journal with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryLifecycleStore {
    collections: Mutex<Collections>,
    faults: FaultInjector,
}

impl InMemoryLifecycleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.set(|f| f.transient = n);
    }

    /// Stored lifecycle of a document of `tenant`.
    pub fn get(&self, collection: &str, tenant: TenantId, id: &str) -> Option<Document> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).and_then(|docs| docs.get(&key(Some(tenant), id)).cloned()))
    }

    /// Number of stored lifecycles in a collection, all tenants.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// True when the collection holds no lifecycle.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Operation counters.
    pub fn stats(&self) -> SinkStats {
        self.faults.stats()
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn upsert(&self, collection: &str, tenant: TenantId, id: &str, lifecycle: Document) -> Result<()> {
        self.faults.enter("lifecycle store unavailable").await?;
        guard(&self.collections)?
            .entry(collection.to_string())
            .or_default()
            .insert(key(Some(tenant), id), lifecycle);
        self.faults.count(|s| s.writes += 1)
    }

    async fn delete(&self, collection: &str, tenant: TenantId, id: &str) -> Result<()> {
        self.faults.enter("lifecycle store unavailable").await?;
        if let Some(docs) = guard(&self.collections)?.get_mut(collection) {
            docs.remove(&key(Some(tenant), id));
        }
        self.faults.count(|s| s.deletes += 1)
    }
}
