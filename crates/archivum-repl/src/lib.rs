#![warn(missing_docs)]

//! Archivum replication subsystem: rebuilds a tenant's primary store and
//! search index from the append-only backup log.
//!
//! Reconstruction is offset-bounded: each (tenant, category) pair carries a
//! durable cursor, every call replays at most `limit` entries past it, and the
//! cursor only advances after the whole batch is applied. Graph data is
//! produced by the [`graph::GraphReconciler`] as batched snapshots and replayed
//! as partial merges.

pub mod backup_log;
pub mod category;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod graph;
pub mod key_lock;
pub mod metrics;
pub mod model;
pub mod offset;
pub mod reconstruction;
pub mod restore;
pub mod sink;

/// Numeric tenant identifier.
pub type TenantId = u32;

pub use backup_log::{BackupLog, FsBackupLog, InMemoryBackupLog, LogAction, LogEntry, Order};
pub use category::{CategoryKind, CategoryRegistry, CollectionConfig, ReconstructableCollection};
pub use config::{MissingEntryPolicy, ReconConfig};
pub use error::{ReconError, Result};
pub use graph::{GraphReconciler, GraphStoreReport};
pub use metrics::ReconstructionMetrics;
pub use model::{ReconstructionRequestItem, ReconstructionResponseItem, Status};
pub use offset::{FileOffsetStore, InMemoryOffsetStore, OffsetCursor, OffsetStore};
pub use reconstruction::{ReconstructionContext, ReconstructionService};
pub use restore::{BackedUpDocument, GraphSnapshot, RestoreBackupService};
pub use sink::{
    InMemoryLifecycleStore, InMemoryPrimaryStore, InMemorySearchIndex, LifecycleStore, PrimaryStore, SearchIndex,
};
