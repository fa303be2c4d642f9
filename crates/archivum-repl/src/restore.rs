//! Materialization of backed-up objects.
//!
//! Reads go through the retry executor: object storage is eventually
//! consistent, so a freshly logged object may briefly read as missing.

use std::sync::Arc;

use archivum_transport::RetryExecutor;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::backup_log::{BackupLog, LogAction, LogEntry, Order};
use crate::document::{self, Document, LIFECYCLE, METADATAS, TENANT};
use crate::error::{ReconError, Result};
use crate::TenantId;

const SNAPSHOT_COMPRESSION_LEVEL: i32 = 3;

/// A document as it was persisted at write time, adapted to sink shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BackedUpDocument {
    /// `_id` of the document.
    pub id: String,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Backup-log sequence the document was read from.
    pub sequence: u64,
    /// Full document body.
    pub body: Document,
    /// Lifecycle persisted next to the document, when the object is an
    /// envelope carrying one.
    pub lifecycle: Option<Document>,
}

/// Graph fields of many documents, computed over one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Sink collection the documents belong to.
    pub collection: String,
    /// Inclusive window start, `_glpd` format.
    pub window_start: String,
    /// Exclusive window end, `_glpd` format.
    pub window_end: String,
    /// Projected documents (`_id` plus graph fields), in bundles.
    pub batches: Vec<Vec<Document>>,
}

impl GraphSnapshot {
    /// Number of documents across all batches.
    pub fn document_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// zstd-compressed JSON encoding.
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        let compressed = zstd::encode_all(&json[..], SNAPSHOT_COMPRESSION_LEVEL)
            .map_err(|e| ReconError::GraphStore { msg: e.to_string() })?;
        Ok(Bytes::from(compressed))
    }

    /// Inverse of [`encode`](Self::encode). Any failure is a malformed payload.
    pub fn decode(file_name: &str, data: &[u8]) -> Result<Self> {
        let json = zstd::decode_all(data).map_err(|e| ReconError::malformed(file_name, e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| ReconError::malformed(file_name, e.to_string()))
    }
}

/// Split a backed-up object into its document and lifecycle.
///
/// Objects are either a bare document or a `{metadatas, lifecycle}` envelope.
fn unwrap_envelope(file_name: &str, mut object: Document) -> Result<(Document, Option<Document>)> {
    if !object.contains_key(METADATAS) {
        return Ok((object, None));
    }
    let Some(Value::Object(body)) = object.remove(METADATAS) else {
        return Err(ReconError::malformed(file_name, "metadatas is not a JSON object"));
    };
    let lifecycle = match object.remove(LIFECYCLE) {
        None | Some(Value::Null) => None,
        Some(Value::Object(lifecycle)) => Some(lifecycle),
        Some(_) => return Err(ReconError::malformed(file_name, "lifecycle is not a JSON object")),
    };
    Ok((body, lifecycle))
}

/// Turn a raw JSON object into a sink-shaped document.
fn adapt(tenant: TenantId, entry: &LogEntry, raw: &[u8], strip_fields: &[String]) -> Result<BackedUpDocument> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ReconError::malformed(&entry.file_name, e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(ReconError::malformed(&entry.file_name, "not a JSON object"));
    };
    let (mut body, lifecycle) = unwrap_envelope(&entry.file_name, object)?;
    let id = document::doc_id(&body)
        .map(str::to_string)
        .ok_or_else(|| ReconError::malformed(&entry.file_name, "missing _id"))?;
    if body.contains_key(TENANT) && document::doc_tenant(&body) != Some(tenant) {
        return Err(ReconError::malformed(
            &entry.file_name,
            format!("_tenant does not match stream tenant {}", tenant),
        ));
    }
    document::strip_fields(&mut body, strip_fields);
    body.insert(TENANT.to_string(), Value::from(tenant));
    Ok(BackedUpDocument {
        id,
        tenant,
        sequence: entry.sequence,
        body,
        lifecycle,
    })
}

/// Read side of the backup log used by reconstruction and the reconciler.
#[derive(Clone)]
pub struct RestoreBackupService {
    log: Arc<dyn BackupLog>,
    retry: RetryExecutor,
    bulk_size: usize,
}

impl RestoreBackupService {
    /// Create the service. `bulk_size` is the listing page size.
    pub fn new(log: Arc<dyn BackupLog>, retry: RetryExecutor, bulk_size: usize) -> Self {
        Self {
            log,
            retry,
            bulk_size: bulk_size.max(1),
        }
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<dyn BackupLog> {
        &self.log
    }

    /// The retry executor applied to every read.
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    async fn read(&self, tenant: TenantId, category: &str, file_name: &str) -> Result<Bytes> {
        let log = &self.log;
        self.retry
            .exec(move || log.read_object(tenant, category, file_name))
            .await
    }

    /// Fetch and adapt the document written by `entry`.
    ///
    /// `strip_fields` are removed and `_tenant` is injected when absent. A
    /// document claiming another tenant than the stream's is malformed.
    pub async fn get_backed_up_document(
        &self,
        tenant: TenantId,
        category: &str,
        entry: &LogEntry,
        strip_fields: &[String],
    ) -> Result<BackedUpDocument> {
        let raw = self.read(tenant, category, &entry.file_name).await?;
        adapt(tenant, entry, &raw, strip_fields)
    }

    /// Fetch and decode the graph snapshot written by `entry`.
    pub async fn get_graph_snapshot(&self, tenant: TenantId, category: &str, entry: &LogEntry) -> Result<GraphSnapshot> {
        let raw = self.read(tenant, category, &entry.file_name).await?;
        GraphSnapshot::decode(&entry.file_name, &raw)
    }

    /// Up to `limit` entries strictly after `from`, ascending.
    ///
    /// The log is read in pages of the configured bulk size; the listing stops
    /// early at the log tip.
    pub async fn list_pending(&self, tenant: TenantId, category: &str, from: u64, limit: usize) -> Result<Vec<LogEntry>> {
        let log = &self.log;
        let mut pending = Vec::new();
        let mut cursor = from;

        while pending.len() < limit {
            let page = self.bulk_size.min(limit - pending.len());
            let entries = self
                .retry
                .exec(move || log.list_entries(tenant, category, Some(cursor), Some(page), Order::Asc))
                .await?;
            let fetched = entries.len();
            if let Some(last) = entries.last() {
                cursor = last.sequence;
            }
            pending.extend(entries);
            if fetched < page {
                break;
            }
        }

        debug!(tenant, category, from, limit, pending = pending.len(), "listed pending entries");
        Ok(pending)
    }

    /// True when an entry after `entry` deletes the same object.
    pub async fn deleted_later(&self, tenant: TenantId, category: &str, entry: &LogEntry) -> Result<bool> {
        let log = &self.log;
        let from = entry.sequence;
        let later = self
            .retry
            .exec(move || log.list_entries(tenant, category, Some(from), None, Order::Asc))
            .await?;
        Ok(later
            .iter()
            .any(|e| e.action == LogAction::Delete && e.file_name == entry.file_name))
    }

    /// The most recent entry of the stream, if any.
    pub async fn latest_entry(&self, tenant: TenantId, category: &str) -> Result<Option<LogEntry>> {
        let log = &self.log;
        let mut latest = self
            .retry
            .exec(move || log.list_entries(tenant, category, None, Some(1), Order::Desc))
            .await?;
        Ok(latest.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_log::InMemoryBackupLog;
    use archivum_transport::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn service(log: Arc<InMemoryBackupLog>, bulk: usize) -> RestoreBackupService {
        let retry = RetryExecutor::new(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO));
        RestoreBackupService::new(log, retry, bulk)
    }

    async fn put(log: &InMemoryBackupLog, tenant: TenantId, body: Value) -> LogEntry {
        let id = body["_id"].as_str().unwrap_or("x").to_string();
        log.append(tenant, "UNIT", &format!("{}.json", id), LogAction::Write, Bytes::from(body.to_string()))
            .await
            .unwrap()
    }

    fn strip() -> Vec<String> {
        vec!["_av".to_string()]
    }

    #[tokio::test]
    async fn test_document_is_adapted_to_sink_shape() {
        let log = Arc::new(InMemoryBackupLog::new());
        let entry = put(&log, 4, json!({"_id": "u1", "_av": 7, "_v": 2, "Title": "t"})).await;
        let svc = service(log, 10);
        let doc = svc.get_backed_up_document(4, "UNIT", &entry, &strip()).await.unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.tenant, 4);
        assert_eq!(doc.sequence, 1);
        assert_eq!(Value::Object(doc.body), json!({"_id": "u1", "_v": 2, "Title": "t", "_tenant": 4}));
        assert!(doc.lifecycle.is_none());
    }

    #[tokio::test]
    async fn test_envelope_carries_lifecycle() {
        let log = Arc::new(InMemoryBackupLog::new());
        let with = log
            .append(
                2,
                "UNIT",
                "u1.json",
                LogAction::Write,
                Bytes::from(json!({"metadatas": {"_id": "u1", "_av": 1}, "lifecycle": {"_id": "u1", "events": []}}).to_string()),
            )
            .await
            .unwrap();
        let without = log
            .append(
                2,
                "UNIT",
                "u2.json",
                LogAction::Write,
                Bytes::from(json!({"metadatas": {"_id": "u2"}, "lifecycle": null}).to_string()),
            )
            .await
            .unwrap();
        let svc = service(log, 10);

        let doc = svc.get_backed_up_document(2, "UNIT", &with, &strip()).await.unwrap();
        assert_eq!(Value::Object(doc.body), json!({"_id": "u1", "_tenant": 2}));
        assert_eq!(doc.lifecycle.map(Value::Object), Some(json!({"_id": "u1", "events": []})));

        let doc = svc.get_backed_up_document(2, "UNIT", &without, &strip()).await.unwrap();
        assert_eq!(doc.id, "u2");
        assert!(doc.lifecycle.is_none());
    }

    #[tokio::test]
    async fn test_foreign_tenant_document_is_malformed() {
        let log = Arc::new(InMemoryBackupLog::new());
        let foreign = put(&log, 2, json!({"_id": "a", "_tenant": 0})).await;
        let own = put(&log, 2, json!({"_id": "b", "_tenant": 2})).await;
        let svc = service(log, 10);
        assert!(matches!(
            svc.get_backed_up_document(2, "UNIT", &foreign, &strip()).await,
            Err(ReconError::MalformedPayload { .. })
        ));
        assert_eq!(svc.get_backed_up_document(2, "UNIT", &own, &strip()).await.unwrap().tenant, 2);
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        let log = Arc::new(InMemoryBackupLog::new());
        let no_id = put(&log, 0, json!({"Title": "t"})).await;
        let array = log
            .append(0, "UNIT", "arr.json", LogAction::Write, Bytes::from_static(b"[1,2]"))
            .await
            .unwrap();
        let garbage = log
            .append(0, "UNIT", "bad.json", LogAction::Write, Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let bad_envelope = log
            .append(0, "UNIT", "env.json", LogAction::Write, Bytes::from_static(br#"{"metadatas": {"_id": "e"}, "lifecycle": 3}"#))
            .await
            .unwrap();
        let svc = service(log, 10);
        for entry in [no_id, array, garbage, bad_envelope] {
            let err = svc.get_backed_up_document(0, "UNIT", &entry, &strip()).await.unwrap_err();
            assert!(matches!(err, ReconError::MalformedPayload { .. }), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_transient_read_failures_are_retried() {
        let log = Arc::new(InMemoryBackupLog::new());
        let entry = put(&log, 0, json!({"_id": "u1"})).await;
        log.fail_next_reads(2);
        let svc = service(log, 10);
        assert!(svc.get_backed_up_document(0, "UNIT", &entry, &strip()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_object_surfaces_after_retries() {
        let log = Arc::new(InMemoryBackupLog::new());
        let entry = put(&log, 0, json!({"_id": "u1"})).await;
        log.hide_object("u1.json");
        let svc = service(log, 10);
        let err = svc.get_backed_up_document(0, "UNIT", &entry, &strip()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_pending_pages_through_the_log() {
        let log = Arc::new(InMemoryBackupLog::new());
        for i in 0..7 {
            put(&log, 0, json!({ "_id": format!("u{}", i) })).await;
        }
        let svc = service(log, 2);
        let seqs = |v: Vec<LogEntry>| v.into_iter().map(|e| e.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(svc.list_pending(0, "UNIT", 0, 5).await.unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(seqs(svc.list_pending(0, "UNIT", 5, 100).await.unwrap()), vec![6, 7]);
        assert!(svc.list_pending(0, "UNIT", 7, 100).await.unwrap().is_empty());
        assert!(svc.list_pending(0, "UNIT", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_later() {
        let log = Arc::new(InMemoryBackupLog::new());
        let a = put(&log, 0, json!({"_id": "a"})).await;
        let b = put(&log, 0, json!({"_id": "b"})).await;
        log.append(0, "UNIT", "a.json", LogAction::Delete, Bytes::new()).await.unwrap();
        let svc = service(log, 10);
        assert!(svc.deleted_later(0, "UNIT", &a).await.unwrap());
        assert!(!svc.deleted_later(0, "UNIT", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_entry() {
        let log = Arc::new(InMemoryBackupLog::new());
        let svc = service(log.clone(), 10);
        assert!(svc.latest_entry(0, "UNIT").await.unwrap().is_none());
        put(&log, 0, json!({"_id": "a"})).await;
        put(&log, 0, json!({"_id": "b"})).await;
        assert_eq!(svc.latest_entry(0, "UNIT").await.unwrap().unwrap().file_name, "b.json");
    }

    #[tokio::test]
    async fn test_graph_snapshot_decoding() {
        let snapshot = GraphSnapshot {
            collection: "Unit".into(),
            window_start: "1970-01-01T00:00:00.000".into(),
            window_end: "2024-01-01T00:00:00.000".into(),
            batches: vec![vec![json!({"_id": "u1", "_us": ["p"]}).as_object().cloned().unwrap()]],
        };
        let log = Arc::new(InMemoryBackupLog::new());
        let entry = log
            .append(1, "UNIT_GRAPH", "snap", LogAction::Write, snapshot.encode().unwrap())
            .await
            .unwrap();
        let bad = log
            .append(1, "UNIT_GRAPH", "bad", LogAction::Write, Bytes::from_static(b"plain"))
            .await
            .unwrap();
        let svc = service(log, 10);
        let decoded = svc.get_graph_snapshot(1, "UNIT_GRAPH", &entry).await.unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.document_count(), 1);
        assert!(matches!(
            svc.get_graph_snapshot(1, "UNIT_GRAPH", &bad).await,
            Err(ReconError::MalformedPayload { .. })
        ));
    }
}
