//! Offset-bounded catch-up of the primary store and search index.
//!
//! For each request item the service lists at most `limit` backup-log entries
//! past the item's offset and applies them in sequence order. The offset is
//! advanced once, after the last entry of the batch is applied to both sinks;
//! any failure before that leaves it where it was, so the next call replays
//! the same entries. Sink writes are idempotent, which makes that replay safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use archivum_transport::RetryExecutor;
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::backup_log::{BackupLog, LogAction, LogEntry};
use crate::category::{CategoryKind, CategoryRegistry, ReconstructableCollection};
use crate::config::{MissingEntryPolicy, ReconConfig};
use crate::document::{self, Document, GRAPH_LAST_PERSISTED_DATE, ID, TENANT};
use crate::error::{ReconError, Result};
use crate::key_lock::KeyLocks;
use crate::metrics::{ReconstructionMetrics, UNKNOWN_CATEGORY_LABEL};
use crate::model::{ReconstructionRequestItem, ReconstructionResponseItem};
use crate::offset::OffsetStore;
use crate::restore::RestoreBackupService;
use crate::TenantId;

/// Per-call context carried through logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructionContext {
    /// Identifier attached to every log line of the call.
    pub request_id: Uuid,
}

impl ReconstructionContext {
    /// A context with a fresh request id.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
        }
    }

    /// Span under which the call runs.
    pub fn span(&self) -> Span {
        info_span!("reconstruction", request_id = %self.request_id)
    }
}

impl Default for ReconstructionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    offset: u64,
    applied: u64,
    skipped: u64,
}

/// Rebuilds sinks from the backup log.
pub struct ReconstructionService {
    registry: Arc<CategoryRegistry>,
    restore: RestoreBackupService,
    offsets: Arc<dyn OffsetStore>,
    retry: RetryExecutor,
    locks: Arc<KeyLocks>,
    metrics: Arc<ReconstructionMetrics>,
    admin_tenant: TenantId,
    missing_entries: MissingEntryPolicy,
    max_parallel_items: usize,
    graph_only_purge_delay: Duration,
}

impl ReconstructionService {
    /// Build a service over the given log and offset store.
    pub fn new(
        config: &ReconConfig,
        registry: Arc<CategoryRegistry>,
        log: Arc<dyn BackupLog>,
        offsets: Arc<dyn OffsetStore>,
    ) -> Self {
        let retry = RetryExecutor::new(config.retry.policy());
        Self {
            registry,
            restore: RestoreBackupService::new(log, retry.clone(), config.restore_bulk_size),
            offsets,
            retry,
            locks: Arc::new(KeyLocks::new()),
            metrics: Arc::new(ReconstructionMetrics::new()),
            admin_tenant: config.admin_tenant,
            missing_entries: config.missing_entries,
            max_parallel_items: config.max_parallel_items.max(1),
            graph_only_purge_delay: config.graph_only_purge_delay(),
        }
    }

    /// Share a metrics registry with other services.
    pub fn with_metrics(mut self, metrics: Arc<ReconstructionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics recorded by this service.
    pub fn metrics(&self) -> &Arc<ReconstructionMetrics> {
        &self.metrics
    }

    /// The category registry.
    pub fn registry(&self) -> &Arc<CategoryRegistry> {
        &self.registry
    }

    /// The offset store.
    pub fn offsets(&self) -> &Arc<dyn OffsetStore> {
        &self.offsets
    }

    /// The restore service reading the backup log.
    pub fn restore(&self) -> &RestoreBackupService {
        &self.restore
    }

    /// Process every item, returning one response per item in request order.
    ///
    /// Never fails as a whole: each item reports its own status.
    pub async fn reconstruct(&self, items: &[ReconstructionRequestItem]) -> Vec<ReconstructionResponseItem> {
        self.reconstruct_with(ReconstructionContext::new(), items).await
    }

    /// [`reconstruct`](Self::reconstruct) under a caller-supplied context.
    pub async fn reconstruct_with(
        &self,
        ctx: ReconstructionContext,
        items: &[ReconstructionRequestItem],
    ) -> Vec<ReconstructionResponseItem> {
        async move {
            info!(items = items.len(), "reconstruction requested");
            stream::iter(items.iter().map(|item| self.reconstruct_item(item)))
                .buffered(self.max_parallel_items)
                .collect::<Vec<_>>()
                .await
        }
        .instrument(ctx.span())
        .await
    }

    async fn reconstruct_item(&self, item: &ReconstructionRequestItem) -> ReconstructionResponseItem {
        let started = Instant::now();

        let Some(coll) = self.registry.get(&item.category) else {
            let offset = match self.offsets.find_offset(item.tenant, &item.category).await {
                Ok(stored) => stored,
                Err(_) => item.offset.unwrap_or(0),
            };
            error!(tenant = item.tenant, category = %item.category, offset, known = ?self.registry.names(), "unknown category");
            self.metrics
                .record_item(UNKNOWN_CATEGORY_LABEL, false, 0, 0, started.elapsed());
            return ReconstructionResponseItem::ko(item.tenant, item.category.clone(), offset);
        };

        let tenant = match coll.kind {
            CategoryKind::Flat => item.tenant,
            CategoryKind::Graph => self.admin_tenant,
        };
        let _guard = self.locks.lock(tenant, &coll.category).await;

        let start = match item.offset {
            Some(explicit) => explicit,
            None => {
                let offsets = &self.offsets;
                let category = coll.category.as_str();
                match self.retry.exec(move || offsets.find_offset(tenant, category)).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!(tenant, category, error = %e, "cannot read offset");
                        self.metrics.record_item(&coll.category, false, 0, 0, started.elapsed());
                        return ReconstructionResponseItem::ko(tenant, item.category.clone(), 0);
                    }
                }
            }
        };

        match self.replay(coll, tenant, start, item.limit as usize).await {
            Ok(outcome) => {
                info!(
                    tenant,
                    category = %coll.category,
                    from = start,
                    offset = outcome.offset,
                    applied = outcome.applied,
                    skipped = outcome.skipped,
                    "reconstruction item done"
                );
                self.metrics.record_item(
                    &coll.category,
                    true,
                    outcome.applied,
                    outcome.skipped,
                    started.elapsed(),
                );
                ReconstructionResponseItem::ok(tenant, item.category.clone(), outcome.offset)
            }
            Err(e) => {
                error!(tenant, category = %coll.category, offset = start, error = %e, "reconstruction item failed");
                self.metrics.record_item(&coll.category, false, 0, 0, started.elapsed());
                ReconstructionResponseItem::ko(tenant, item.category.clone(), start)
            }
        }
    }

    async fn replay(
        &self,
        coll: &ReconstructableCollection,
        tenant: TenantId,
        start: u64,
        limit: usize,
    ) -> Result<BatchOutcome> {
        let entries = self
            .restore
            .list_pending(tenant, &coll.category, start, limit)
            .await?;
        let Some(last) = entries.last().map(|e| e.sequence) else {
            return Ok(BatchOutcome {
                offset: start,
                ..BatchOutcome::default()
            });
        };

        let mut outcome = BatchOutcome {
            offset: last,
            ..BatchOutcome::default()
        };
        for entry in &entries {
            let applied = match entry.action {
                LogAction::Delete => self.apply_delete(coll, tenant, entry).await,
                LogAction::Write => match coll.kind {
                    CategoryKind::Flat => self.apply_flat(coll, tenant, entry).await,
                    CategoryKind::Graph => self.apply_graph(coll, tenant, entry).await,
                },
            };
            match applied {
                Ok(()) => outcome.applied += 1,
                Err(e) if e.is_not_found() => {
                    if self.missing_entries == MissingEntryPolicy::Skip {
                        warn!(tenant, category = %coll.category, sequence = entry.sequence, file_name = %entry.file_name, "backup object missing, skipped");
                    } else if self.restore.deleted_later(tenant, &coll.category, entry).await? {
                        debug!(tenant, category = %coll.category, sequence = entry.sequence, file_name = %entry.file_name, "object deleted by a later entry, skipped");
                    } else {
                        warn!(tenant, category = %coll.category, sequence = entry.sequence, error = %e, "backup object missing");
                        return Err(e);
                    }
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(tenant, category = %coll.category, sequence = entry.sequence, error = %e, "entry replay failed");
                    return Err(e);
                }
            }
        }

        let offsets = &self.offsets;
        let category = coll.category.as_str();
        self.retry
            .execute(move || offsets.create_or_update_offset(tenant, category, last))
            .await?;
        Ok(outcome)
    }

    /// Replace the document in the primary store, keeping its graph fields,
    /// then mirror the result into the index and replay its lifecycle.
    async fn apply_flat(&self, coll: &ReconstructableCollection, tenant: TenantId, entry: &LogEntry) -> Result<()> {
        let restored = self
            .restore
            .get_backed_up_document(tenant, &coll.category, entry, &coll.strip_fields)
            .await?;
        if coll.lifecycles.is_some() && restored.lifecycle.is_none() {
            return Err(ReconError::malformed(&entry.file_name, "lifecycle should not be null"));
        }

        let primary = &coll.primary;
        let collection = coll.collection.as_str();
        let graph_fields = &coll.graph_fields;
        let restored = &restored;
        let stored = self
            .retry
            .exec(move || async move {
                let live = primary.find(collection, tenant, &restored.id).await?;
                let mut body = restored.body.clone();
                let expected = live.as_ref().and_then(document::graph_stamp);
                if let Some(live) = &live {
                    document::merge_fields(&mut body, &document::project(live, graph_fields));
                    if let Some(glpd) = live.get(GRAPH_LAST_PERSISTED_DATE) {
                        body.insert(GRAPH_LAST_PERSISTED_DATE.to_string(), glpd.clone());
                    }
                }
                primary.replace(collection, tenant, body.clone(), expected).await?;
                Ok::<Document, ReconError>(body)
            })
            .await?;

        let index = &coll.index;
        self.retry
            .execute(move || index.upsert(collection, tenant, stored.clone()))
            .await?;

        if let (Some(lifecycles), Some(lifecycle)) = (&coll.lifecycles, &restored.lifecycle) {
            let id = restored.id.as_str();
            self.retry
                .execute(move || lifecycles.upsert(collection, tenant, id, lifecycle.clone()))
                .await?;
        }
        debug!(tenant, category = %coll.category, id = %restored.id, sequence = entry.sequence, "document restored");
        Ok(())
    }

    async fn apply_delete(&self, coll: &ReconstructableCollection, tenant: TenantId, entry: &LogEntry) -> Result<()> {
        if coll.kind == CategoryKind::Graph {
            // Removing a snapshot object has no effect on documents.
            return Ok(());
        }
        let id = document::id_from_file_name(&entry.file_name);
        let collection = coll.collection.as_str();
        let primary = &coll.primary;
        let index = &coll.index;
        self.retry.execute(move || primary.delete(collection, tenant, id)).await?;
        self.retry.execute(move || index.delete(collection, tenant, id)).await?;
        if let Some(lifecycles) = &coll.lifecycles {
            self.retry.execute(move || lifecycles.delete(collection, tenant, id)).await?;
        }
        debug!(tenant, category = %coll.category, id, sequence = entry.sequence, "document deleted");
        Ok(())
    }

    /// Merge graph fields of every snapshot element into the document of the
    /// tenant it belongs to. Elements without `_tenant` update graph-only
    /// documents, which are not indexed.
    async fn apply_graph(&self, coll: &ReconstructableCollection, tenant: TenantId, entry: &LogEntry) -> Result<()> {
        let snapshot = self
            .restore
            .get_graph_snapshot(tenant, &coll.category, entry)
            .await?;
        if snapshot.collection != coll.collection {
            return Err(ReconError::malformed(
                &entry.file_name,
                format!("snapshot of {} in stream of {}", snapshot.collection, coll.collection),
            ));
        }

        let collection = coll.collection.as_str();
        let primary = &coll.primary;
        let index = &coll.index;
        for element in snapshot.batches.iter().flatten() {
            let id = document::doc_id(element)
                .ok_or_else(|| ReconError::malformed(&entry.file_name, "graph element without _id"))?;
            let owner = document::doc_tenant(element);
            let mut fields = document::project(element, &coll.graph_fields);
            fields.remove(ID);
            fields.remove(TENANT);

            let fields = &fields;
            let merged = self
                .retry
                .exec(move || primary.merge_graph(collection, owner, id, fields.clone()))
                .await?;
            if let Some(doc_tenant) = document::doc_tenant(&merged) {
                self.retry
                    .execute(move || index.upsert(collection, doc_tenant, merged.clone()))
                    .await?;
            }
        }
        debug!(
            category = %coll.category,
            documents = snapshot.document_count(),
            window_end = %snapshot.window_end,
            "graph snapshot merged"
        );
        Ok(())
    }

    /// Delete graph-only documents (no `_tenant`) whose `_glpd` is older than
    /// `now` minus the configured delay. Returns how many were deleted.
    pub async fn purge_graph_only_documents(&self, category: &str, now: NaiveDateTime) -> Result<u64> {
        let coll = self.registry.get(category).ok_or_else(|| ReconError::UnknownCategory {
            name: category.to_string(),
        })?;
        let delay = chrono::Duration::from_std(self.graph_only_purge_delay)
            .map_err(|e| ReconError::Config { msg: e.to_string() })?;
        let limit = now.checked_sub_signed(delay).ok_or_else(|| ReconError::Config {
            msg: "purge delay out of range".to_string(),
        })?;
        let older_than = document::format_date(limit);

        let primary = &coll.primary;
        let collection = coll.collection.as_str();
        let threshold = older_than.as_str();
        let purged = self
            .retry
            .exec(move || primary.purge_graph_only(collection, threshold))
            .await?;
        self.metrics.record_purge(&coll.category, purged);
        info!(category = %coll.category, older_than = %older_than, purged, "graph-only documents purged");
        Ok(purged)
    }
}
