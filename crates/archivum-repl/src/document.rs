//! JSON documents as held by the primary store and the search index.

use chrono::NaiveDateTime;
use serde_json::{Map, Value};

use crate::TenantId;

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Document identifier field.
pub const ID: &str = "_id";
/// Owning tenant field. Absent on graph-only documents.
pub const TENANT: &str = "_tenant";
/// Document version, carried through reconstruction.
pub const VERSION: &str = "_v";
/// Atomic version counter, owned by the primary store.
pub const ATOMIC_VERSION: &str = "_av";
/// Date at which graph fields were last computed.
pub const GRAPH_LAST_PERSISTED_DATE: &str = "_glpd";

/// Envelope field holding the document of a backed-up object.
pub const METADATAS: &str = "metadatas";
/// Envelope field holding the lifecycle of a backed-up object.
pub const LIFECYCLE: &str = "lifecycle";

/// Sortable textual form used for `_glpd` values.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Format a timestamp the way `_glpd` stores it.
pub fn format_date(date: NaiveDateTime) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// The `_id` of a document, if it is a string.
pub fn doc_id(doc: &Document) -> Option<&str> {
    doc.get(ID).and_then(Value::as_str)
}

/// The `_tenant` of a document, if present and numeric.
pub fn doc_tenant(doc: &Document) -> Option<TenantId> {
    doc.get(TENANT)
        .and_then(Value::as_u64)
        .and_then(|t| TenantId::try_from(t).ok())
}

/// The `_glpd` of a document, if present.
pub fn graph_stamp(doc: &Document) -> Option<String> {
    doc.get(GRAPH_LAST_PERSISTED_DATE)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Remove the given fields in place.
pub fn strip_fields(doc: &mut Document, fields: &[String]) {
    for field in fields {
        doc.remove(field);
    }
}

/// Copy of `doc` restricted to `_id` and `fields`.
pub fn project(doc: &Document, fields: &[String]) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get(ID) {
        out.insert(ID.to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = doc.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// `$set` semantics: overwrite `target` with every field of `fields`.
pub fn merge_fields(target: &mut Document, fields: &Document) {
    for (k, v) in fields {
        target.insert(k.clone(), v.clone());
    }
}

/// Id encoded in a backup object name (`<id>.json`).
pub fn id_from_file_name(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(pos) => &file_name[..pos],
        None => file_name,
    }
}
