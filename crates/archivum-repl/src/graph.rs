//! Periodic production of graph snapshots.
//!
//! Each run covers the window between the end of the previous snapshot and
//! `now - overlap`, collects the graph fields of every document whose `_glpd`
//! falls in it, and logs them as one compressed object named
//! `<start>_<end>` under the admin tenant. The next run reads its start back
//! from that name, so windows chain without gaps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archivum_transport::RetryExecutor;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backup_log::{BackupLog, LogAction};
use crate::category::{CategoryKind, CategoryRegistry, ReconstructableCollection};
use crate::config::ReconConfig;
use crate::document::{self, Document, TENANT};
use crate::error::{ReconError, Result};
use crate::metrics::ReconstructionMetrics;
use crate::restore::{GraphSnapshot, RestoreBackupService};
use crate::TenantId;

/// Date format of snapshot object names.
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%3f";

/// Start of the very first window.
pub fn initial_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Object name of the snapshot covering `[start, end)`.
pub fn snapshot_name(start: NaiveDateTime, end: NaiveDateTime) -> String {
    format!("{}_{}", start.format(SNAPSHOT_NAME_FORMAT), end.format(SNAPSHOT_NAME_FORMAT))
}

/// Window end encoded in a snapshot object name.
pub fn window_end_from_name(file_name: &str) -> Result<NaiveDateTime> {
    let end = file_name.split('_').nth(1).ok_or_else(|| ReconError::GraphStore {
        msg: format!("snapshot name {} has no window end", file_name),
    })?;
    NaiveDateTime::parse_from_str(end, SNAPSHOT_NAME_FORMAT).map_err(|e| ReconError::GraphStore {
        msg: format!("snapshot name {}: {}", file_name, e),
    })
}

/// Outcome of one [`GraphReconciler::try_store_graph`] run.
///
/// Categories that stored their snapshot keep their count even when a
/// sibling category failed.
#[derive(Debug, Default)]
pub struct GraphStoreReport {
    /// Documents stored per category that succeeded (zero when skipped).
    pub stored: BTreeMap<String, u64>,
    /// Error of every category that failed.
    pub failed: BTreeMap<String, ReconError>,
}

impl GraphStoreReport {
    /// True when no category failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Documents stored for `category`, if it succeeded.
    pub fn count(&self, category: &str) -> Option<u64> {
        self.stored.get(category).copied()
    }

    /// Documents stored across all categories.
    pub fn total(&self) -> u64 {
        self.stored.values().sum()
    }
}

/// Resets the in-progress flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Producer of graph snapshots for every graph category.
pub struct GraphReconciler {
    registry: Arc<CategoryRegistry>,
    restore: RestoreBackupService,
    retry: RetryExecutor,
    metrics: Arc<ReconstructionMetrics>,
    admin_tenant: TenantId,
    overlap_delay: Duration,
    batch_size: usize,
    in_progress: AtomicBool,
}

impl GraphReconciler {
    /// Build a reconciler writing into `log`.
    pub fn new(config: &ReconConfig, registry: Arc<CategoryRegistry>, log: Arc<dyn BackupLog>) -> Self {
        let retry = RetryExecutor::new(config.retry.policy());
        Self {
            registry,
            restore: RestoreBackupService::new(log, retry.clone(), config.restore_bulk_size),
            retry,
            metrics: Arc::new(ReconstructionMetrics::new()),
            admin_tenant: config.admin_tenant,
            overlap_delay: config.graph_overlap_delay(),
            batch_size: config.graph_batch_size.max(1),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Share a metrics registry with other services.
    pub fn with_metrics(mut self, metrics: Arc<ReconstructionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// True while a [`try_store_graph`](Self::try_store_graph) run is active.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run every graph category once, unless a run is already active.
    ///
    /// Reports the documents stored per category, and the error of each
    /// category that failed. All counts are zero when another run holds the
    /// flag.
    pub async fn try_store_graph(&self) -> GraphStoreReport {
        self.try_store_graph_at(Utc::now().naive_utc()).await
    }

    /// [`try_store_graph`](Self::try_store_graph) with an explicit clock.
    pub async fn try_store_graph_at(&self, now: NaiveDateTime) -> GraphStoreReport {
        let categories: Vec<&ReconstructableCollection> = self.registry.graph_collections().collect();

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("graph store already in progress");
            return GraphStoreReport {
                stored: categories.iter().map(|c| (c.category.clone(), 0)).collect(),
                failed: BTreeMap::new(),
            };
        }
        let _guard = RunGuard(&self.in_progress);

        let runs = categories.iter().map(|c| async move {
            let stored = self.store_graph_at(&c.category, now).await;
            (c.category.clone(), stored)
        });

        let mut report = GraphStoreReport::default();
        for (category, outcome) in join_all(runs).await {
            match outcome {
                Ok(n) => {
                    report.stored.insert(category, n);
                }
                Err(e) => {
                    error!(category = %category, error = %e, "graph store failed");
                    report.failed.insert(category, e);
                }
            }
        }
        info!(
            stored = report.total(),
            succeeded = report.stored.len(),
            failed = report.failed.len(),
            "graph store run done"
        );
        report
    }

    /// Produce one snapshot for `category`, returning the number of documents
    /// it holds. Nothing is written when no document changed in the window.
    pub async fn store_graph_at(&self, category: &str, now: NaiveDateTime) -> Result<u64> {
        let coll = self
            .registry
            .get(category)
            .filter(|c| c.kind == CategoryKind::Graph)
            .ok_or_else(|| ReconError::UnknownCategory {
                name: category.to_string(),
            })?;

        let start = match self.restore.latest_entry(self.admin_tenant, &coll.category).await? {
            Some(last) => window_end_from_name(&last.file_name)?,
            None => initial_start(),
        };
        let overlap = chrono::Duration::from_std(self.overlap_delay)
            .map_err(|e| ReconError::Config { msg: e.to_string() })?;
        let end = now.checked_sub_signed(overlap).ok_or_else(|| ReconError::Config {
            msg: "graph overlap delay out of range".to_string(),
        })?;
        if end < start {
            error!(
                category = %coll.category,
                start = %start,
                end = %end,
                "graph window ends before it starts, check clocks"
            );
            return Ok(0);
        }

        let window_start = document::format_date(start);
        let window_end = document::format_date(end);
        let primary = &coll.primary;
        let collection = coll.collection.as_str();
        let (from, to) = (window_start.as_str(), window_end.as_str());
        let updated = self
            .retry
            .exec(move || primary.find_graph_updated(collection, from, to))
            .await?;
        if updated.is_empty() {
            debug!(category = %coll.category, %window_start, %window_end, "no graph change in window");
            return Ok(0);
        }

        let projected: Vec<Document> = updated
            .iter()
            .map(|d| {
                let mut element = document::project(d, &coll.graph_fields);
                if let Some(owner) = d.get(TENANT) {
                    element.insert(TENANT.to_string(), owner.clone());
                }
                element
            })
            .collect();
        let count = projected.len() as u64;
        let snapshot = GraphSnapshot {
            collection: coll.collection.clone(),
            window_start,
            window_end,
            batches: projected.chunks(self.batch_size).map(<[Document]>::to_vec).collect(),
        };
        let payload = snapshot.encode()?;
        let name = snapshot_name(start, end);

        let log = self.restore.log();
        let tenant = self.admin_tenant;
        let graph_category = coll.category.as_str();
        let file_name = name.as_str();
        let entry = self
            .retry
            .exec(move || log.append(tenant, graph_category, file_name, LogAction::Write, payload.clone()))
            .await?;

        self.metrics.record_graph_stored(&coll.category, count);
        info!(
            category = %coll.category,
            documents = count,
            batches = snapshot.batches.len(),
            sequence = entry.sequence,
            file_name = %name,
            "graph snapshot stored"
        );
        Ok(count)
    }
}
