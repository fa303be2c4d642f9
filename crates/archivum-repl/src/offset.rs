//! Durable reconstruction progress per (tenant, category).
//!
//! A cursor records the last backup-log sequence whose effects are known to be
//! applied to both sinks. Unknown pairs read as 0. Stored values never move
//! backwards: an update lower than the current value is absorbed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{ReconError, Result};
use crate::TenantId;

/// A (tenant, category) position in the backup log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCursor {
    /// Tenant owning the stream.
    pub tenant: TenantId,
    /// Category name.
    pub category: String,
    /// Last applied sequence; 0 when nothing was applied.
    pub last_sequence: u64,
}

impl OffsetCursor {
    /// Create a new cursor.
    pub fn new(tenant: TenantId, category: impl Into<String>, last_sequence: u64) -> Self {
        Self {
            tenant,
            category: category.into(),
            last_sequence,
        }
    }
}

/// Offset persistence.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Stored offset, 0 if never written.
    async fn find_offset(&self, tenant: TenantId, category: &str) -> Result<u64>;

    /// Upsert the offset. Values lower than the stored one are ignored.
    async fn create_or_update_offset(&self, tenant: TenantId, category: &str, value: u64) -> Result<()>;

    /// Every stored cursor, sorted by (tenant, category).
    async fn all_offsets(&self) -> Result<Vec<OffsetCursor>>;
}

type CursorMap = HashMap<(TenantId, String), u64>;

fn advance(cursors: &mut CursorMap, tenant: TenantId, category: &str, value: u64) -> bool {
    let slot = cursors.entry((tenant, category.to_string())).or_insert(0);
    if value > *slot {
        *slot = value;
        true
    } else {
        false
    }
}

fn sorted(cursors: &CursorMap) -> Vec<OffsetCursor> {
    let mut out: Vec<_> = cursors
        .iter()
        .map(|((tenant, category), &seq)| OffsetCursor::new(*tenant, category.clone(), seq))
        .collect();
    out.sort_by(|a, b| (a.tenant, &a.category).cmp(&(b.tenant, &b.category)));
    out
}

/// Process-local offset store.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    cursors: Mutex<CursorMap>,
    failing_writes: Mutex<u32>,
}

impl InMemoryOffsetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` updates fail with [`ReconError::OffsetPersistence`].
    pub async fn fail_next_writes(&self, n: u32) {
        *self.failing_writes.lock().await = n;
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn find_offset(&self, tenant: TenantId, category: &str) -> Result<u64> {
        let cursors = self.cursors.lock().await;
        Ok(cursors.get(&(tenant, category.to_string())).copied().unwrap_or(0))
    }

    async fn create_or_update_offset(&self, tenant: TenantId, category: &str, value: u64) -> Result<()> {
        {
            let mut failing = self.failing_writes.lock().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(ReconError::OffsetPersistence {
                    tenant,
                    category: category.to_string(),
                    msg: "offset store unavailable".to_string(),
                });
            }
        }
        let mut cursors = self.cursors.lock().await;
        advance(&mut cursors, tenant, category, value);
        Ok(())
    }

    async fn all_offsets(&self) -> Result<Vec<OffsetCursor>> {
        Ok(sorted(&*self.cursors.lock().await))
    }
}

/// Offset store persisted as a JSON file.
///
/// Every update rewrites the whole file through a temp file, `fsync` and
/// rename, so a crash leaves either the old or the new content. File I/O runs
/// on tokio's blocking pool; the cursor lock is held until the rename lands
/// so concurrent updates reach the disk in order.
#[derive(Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
    cursors: Mutex<CursorMap>,
}

impl FileOffsetStore {
    /// Open the store at `path`, loading existing cursors if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cursors = match std::fs::read(&path) {
            Ok(data) => {
                let list: Vec<OffsetCursor> = serde_json::from_slice(&data)?;
                list.into_iter()
                    .map(|c| ((c.tenant, c.category), c.last_sequence))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CursorMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), cursors = cursors.len(), "offset store opened");
        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, cursors: &CursorMap) -> std::io::Result<()> {
        let encoded = serde_json::to_vec_pretty(&sorted(cursors))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("tmp");
        {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            tmp.write_all(&encoded).await?;
            tmp.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn find_offset(&self, tenant: TenantId, category: &str) -> Result<u64> {
        let cursors = self.cursors.lock().await;
        Ok(cursors.get(&(tenant, category.to_string())).copied().unwrap_or(0))
    }

    async fn create_or_update_offset(&self, tenant: TenantId, category: &str, value: u64) -> Result<()> {
        let mut cursors = self.cursors.lock().await;
        let mut next = cursors.clone();
        if !advance(&mut next, tenant, category, value) {
            return Ok(());
        }
        if let Err(e) = self.persist(&next).await {
            error!(tenant, category, value, error = %e, "failed to persist offset");
            return Err(ReconError::OffsetPersistence {
                tenant,
                category: category.to_string(),
                msg: e.to_string(),
            });
        }
        *cursors = next;
        Ok(())
    }

    async fn all_offsets(&self) -> Result<Vec<OffsetCursor>> {
        Ok(sorted(&*self.cursors.lock().await))
    }
}
