//! Backup log: the append-only catalog of object-storage writes per (tenant, category).
//!
//! Every write made by the archive write path is recorded as a [`LogEntry`]
//! carrying a sequence number that starts at 1 and increases strictly within
//! its (tenant, category) stream. Readers get a stable snapshot per call;
//! appends may keep arriving afterwards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ReconError, Result};
use crate::TenantId;

/// Listing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Oldest first.
    Asc,
    /// Newest first.
    Desc,
}

/// What the write path did with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogAction {
    /// Object written (created or replaced).
    Write,
    /// Object deleted.
    Delete,
}

/// A single backup log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number within the (tenant, category) stream, starting at 1.
    pub sequence: u64,
    /// Object storage container holding the object.
    pub container: String,
    /// Object name within the container.
    pub file_name: String,
    /// Write or delete.
    pub action: LogAction,
    /// Microseconds since Unix epoch at append time.
    pub timestamp_us: u64,
}

/// Container name of a (tenant, category) stream.
pub fn container_name(tenant: TenantId, category: &str) -> String {
    format!("{}_{}", tenant, category.to_lowercase())
}

/// Read side of the backup log, plus the append used by producers.
#[async_trait]
pub trait BackupLog: Send + Sync {
    /// List entries strictly after (ASC) or before (DESC) `from_exclusive`.
    ///
    /// `None` starts at the beginning for ASC and at the tip for DESC.
    /// `limit = None` returns every matching entry.
    async fn list_entries(
        &self,
        tenant: TenantId,
        category: &str,
        from_exclusive: Option<u64>,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<LogEntry>>;

    /// Fetch the content of a backed-up object.
    async fn read_object(&self, tenant: TenantId, category: &str, file_name: &str) -> Result<Bytes>;

    /// Append a new entry, storing `payload` for writes.
    async fn append(
        &self,
        tenant: TenantId,
        category: &str,
        file_name: &str,
        action: LogAction,
        payload: Bytes,
    ) -> Result<LogEntry>;
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Apply `from`/`limit`/`order` to a stream already sorted by sequence.
fn select(entries: &[LogEntry], from_exclusive: Option<u64>, limit: Option<usize>, order: Order) -> Vec<LogEntry> {
    let limit = limit.unwrap_or(usize::MAX);
    match order {
        Order::Asc => entries
            .iter()
            .filter(|e| from_exclusive.map_or(true, |from| e.sequence > from))
            .take(limit)
            .cloned()
            .collect(),
        Order::Desc => entries
            .iter()
            .rev()
            .filter(|e| from_exclusive.map_or(true, |from| e.sequence < from))
            .take(limit)
            .cloned()
            .collect(),
    }
}

fn check_file_name(file_name: &str) -> Result<()> {
    if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') || file_name == ".." {
        return Err(ReconError::InvalidRequest {
            msg: format!("invalid object name {:?}", file_name),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<LogEntry>,
    objects: HashMap<String, Bytes>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_lists: u32,
    failing_reads: u32,
    hidden: HashSet<String>,
}

/// In-memory backup log with fault injection, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryBackupLog {
    streams: Mutex<HashMap<(TenantId, String), Stream>>,
    faults: Mutex<Faults>,
}

impl InMemoryBackupLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` listings fail with a transient error.
    pub fn fail_next_lists(&self, n: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_lists = n;
        }
    }

    /// The next `n` object reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_reads = n;
        }
    }

    /// Reads of `file_name` report NotFound until [`reveal_object`](Self::reveal_object).
    pub fn hide_object(&self, file_name: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.hidden.insert(file_name.to_string());
        }
    }

    /// Undo [`hide_object`](Self::hide_object).
    pub fn reveal_object(&self, file_name: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.hidden.remove(file_name);
        }
    }

    /// Overwrite the stored content of an object without logging a new entry.
    pub fn overwrite_object(&self, tenant: TenantId, category: &str, file_name: &str, payload: Bytes) {
        if let Ok(mut streams) = self.streams.lock() {
            streams
                .entry((tenant, category.to_string()))
                .or_default()
                .objects
                .insert(file_name.to_string(), payload);
        }
    }

    /// Number of entries in a stream.
    pub fn len(&self, tenant: TenantId, category: &str) -> usize {
        self.streams
            .lock()
            .map(|s| s.get(&(tenant, category.to_string())).map_or(0, |st| st.entries.len()))
            .unwrap_or(0)
    }

    /// True when the stream holds no entry.
    pub fn is_empty(&self, tenant: TenantId, category: &str) -> bool {
        self.len(tenant, category) == 0
    }

    fn take_fault(&self, reads: bool) -> Result<bool> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|e| ReconError::transient(e.to_string()))?;
        let counter = if reads {
            &mut faults.failing_reads
        } else {
            &mut faults.failing_lists
        };
        if *counter > 0 {
            *counter -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn is_hidden(&self, file_name: &str) -> Result<bool> {
        let faults = self
            .faults
            .lock()
            .map_err(|e| ReconError::transient(e.to_string()))?;
        Ok(faults.hidden.contains(file_name))
    }
}

#[async_trait]
impl BackupLog for InMemoryBackupLog {
    async fn list_entries(
        &self,
        tenant: TenantId,
        category: &str,
        from_exclusive: Option<u64>,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<LogEntry>> {
        if self.take_fault(false)? {
            return Err(ReconError::transient("object storage listing unavailable"));
        }
        let streams = self
            .streams
            .lock()
            .map_err(|e| ReconError::transient(e.to_string()))?;
        Ok(streams
            .get(&(tenant, category.to_string()))
            .map(|s| select(&s.entries, from_exclusive, limit, order))
            .unwrap_or_default())
    }

    async fn read_object(&self, tenant: TenantId, category: &str, file_name: &str) -> Result<Bytes> {
        if self.take_fault(true)? {
            return Err(ReconError::transient("object storage read unavailable"));
        }
        let not_found = || ReconError::NotFound {
            container: container_name(tenant, category),
            file_name: file_name.to_string(),
        };
        if self.is_hidden(file_name)? {
            return Err(not_found());
        }
        let streams = self
            .streams
            .lock()
            .map_err(|e| ReconError::transient(e.to_string()))?;
        streams
            .get(&(tenant, category.to_string()))
            .and_then(|s| s.objects.get(file_name))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn append(
        &self,
        tenant: TenantId,
        category: &str,
        file_name: &str,
        action: LogAction,
        payload: Bytes,
    ) -> Result<LogEntry> {
        check_file_name(file_name)?;
        let mut streams = self
            .streams
            .lock()
            .map_err(|e| ReconError::transient(e.to_string()))?;
        let stream = streams.entry((tenant, category.to_string())).or_default();
        let entry = LogEntry {
            sequence: stream.entries.last().map_or(1, |e| e.sequence + 1),
            container: container_name(tenant, category),
            file_name: file_name.to_string(),
            action,
            timestamp_us: now_us(),
        };
        match action {
            LogAction::Write => {
                stream.objects.insert(file_name.to_string(), payload);
            }
            LogAction::Delete => {
                stream.objects.remove(file_name);
            }
        }
        stream.entries.push(entry.clone());
        Ok(entry)
    }
}

const CATALOG_FILE: &str = "catalog.jsonl";
const OBJECTS_DIR: &str = "objects";

/// One line of an on-disk catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogRecord {
    #[serde(flatten)]
    entry: LogEntry,
    /// blake3 of the object content; empty for deletes.
    digest: String,
}

/// Directory-backed backup log.
///
/// Layout: `<root>/<tenant>/<category>/catalog.jsonl` holds one JSON record
/// per entry; object contents live under `objects/`. Each record carries the
/// blake3 digest of the object it points to, checked on every read.
#[derive(Debug)]
pub struct FsBackupLog {
    root: PathBuf,
    append_lock: tokio::sync::Mutex<()>,
}

impl FsBackupLog {
    /// Open (or lazily create) a log rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Root directory of the log.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, tenant: TenantId, category: &str) -> PathBuf {
        self.root.join(tenant.to_string()).join(category)
    }

    async fn read_catalog(&self, tenant: TenantId, category: &str) -> Result<Vec<CatalogRecord>> {
        let path = self.stream_dir(tenant, category).join(CATALOG_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: CatalogRecord = serde_json::from_str(line).map_err(|e| {
                ReconError::malformed(CATALOG_FILE, format!("line {}: {}", lineno + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl BackupLog for FsBackupLog {
    async fn list_entries(
        &self,
        tenant: TenantId,
        category: &str,
        from_exclusive: Option<u64>,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<LogEntry>> {
        let entries: Vec<LogEntry> = self
            .read_catalog(tenant, category)
            .await?
            .into_iter()
            .map(|r| r.entry)
            .collect();
        Ok(select(&entries, from_exclusive, limit, order))
    }

    async fn read_object(&self, tenant: TenantId, category: &str, file_name: &str) -> Result<Bytes> {
        check_file_name(file_name)?;
        let not_found = || ReconError::NotFound {
            container: container_name(tenant, category),
            file_name: file_name.to_string(),
        };
        let path = self.stream_dir(tenant, category).join(OBJECTS_DIR).join(file_name);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let catalog = self.read_catalog(tenant, category).await?;
        let record = catalog
            .iter()
            .rev()
            .find(|r| r.entry.file_name == file_name)
            .ok_or_else(not_found)?;
        if record.entry.action == LogAction::Delete {
            return Err(not_found());
        }
        let digest = blake3::hash(&data).to_hex().to_string();
        if digest != record.digest {
            return Err(ReconError::malformed(
                file_name,
                format!("digest mismatch: catalog {} content {}", record.digest, digest),
            ));
        }
        Ok(Bytes::from(data))
    }

    async fn append(
        &self,
        tenant: TenantId,
        category: &str,
        file_name: &str,
        action: LogAction,
        payload: Bytes,
    ) -> Result<LogEntry> {
        check_file_name(file_name)?;
        let _guard = self.append_lock.lock().await;

        let dir = self.stream_dir(tenant, category);
        let objects = dir.join(OBJECTS_DIR);
        tokio::fs::create_dir_all(&objects).await?;

        let digest = match action {
            LogAction::Write => {
                let tmp = objects.join(format!(".{}.tmp", file_name));
                tokio::fs::write(&tmp, &payload).await?;
                tokio::fs::rename(&tmp, objects.join(file_name)).await?;
                blake3::hash(&payload).to_hex().to_string()
            }
            LogAction::Delete => {
                match tokio::fs::remove_file(objects.join(file_name)).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                String::new()
            }
        };

        let last = self.read_catalog(tenant, category).await?;
        let entry = LogEntry {
            sequence: last.last().map_or(1, |r| r.entry.sequence + 1),
            container: container_name(tenant, category),
            file_name: file_name.to_string(),
            action,
            timestamp_us: now_us(),
        };
        let mut line = serde_json::to_string(&CatalogRecord {
            entry: entry.clone(),
            digest,
        })?;
        line.push('\n');

        let mut catalog = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(CATALOG_FILE))
            .await?;
        catalog.write_all(line.as_bytes()).await?;
        catalog.sync_data().await?;

        debug!(tenant, category, sequence = entry.sequence, file_name, "backup log entry appended");
        Ok(entry)
    }
}
