//! Date-tagged JSON codec and the bounded parsed-document cache.
//!
//! Documents travel as UTF-8 JSON text with no trailing newline. Dates are
//! encoded as `{"__type":"Date","value":"<RFC 3339>"}` tagged objects so
//! they survive the round trip through TEXT storage.
//!
//! The cache is keyed by a 32-bit xxHash of the document text. Hits return
//! a deep clone — a cached value is never handed out as a shared mutable
//! reference, so caller mutation cannot poison the cache. On a hash
//! collision the entry is refreshed by re-parsing.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde_json::{json, Value};
use xxhash_rust::xxh32::xxh32;

use crate::errors::VellumResult;

/// Tag key marking a wrapped date object.
pub const TYPE_TAG: &str = "__type";
/// Tag value for dates.
pub const DATE_TAG: &str = "Date";

/// Default capacity of the process-wide document cache.
pub const DOCUMENT_CACHE_CAPACITY: u64 = 1000;

/// Wrap a date as its tagged JSON representation.
pub fn date_value(dt: DateTime<Utc>) -> Value {
    json!({ TYPE_TAG: DATE_TAG, "value": dt.to_rfc3339() })
}

/// If `value` is a tagged date object, return the parsed timestamp.
pub fn as_tagged_date(value: &Value) -> Option<DateTime<Utc>> {
    let obj = value.as_object()?;
    if obj.get(TYPE_TAG)?.as_str()? != DATE_TAG {
        return None;
    }
    let iso = obj.get("value")?.as_str()?;
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Serialize a document to its wire form (UTF-8, no trailing newline).
pub fn encode_document(doc: &Value) -> VellumResult<String> {
    Ok(serde_json::to_string(doc)?)
}

/// Bounded LRU of parsed documents, keyed by `xxh32(text)`.
pub struct DocumentCache {
    entries: Cache<u32, Arc<(String, Value)>>,
}

impl DocumentCache {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    /// Parse `text`, consulting the cache. Always returns an owned value.
    pub fn parse(&self, text: &str) -> VellumResult<Value> {
        let key = xxh32(text.as_bytes(), 0);
        if let Some(hit) = self.entries.get(&key) {
            if hit.0 == text {
                return Ok(hit.1.clone());
            }
            // 32-bit collision: refresh the slot with the new text.
        }
        let value: Value = serde_json::from_str(text)?;
        self.entries
            .insert(key, Arc::new((text.to_string(), value.clone())));
        Ok(value)
    }

    /// Number of live entries (approximate, per moka semantics).
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries. Called when the last database handle closes.
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

/// Process-wide document cache shared by all databases.
///
/// Keying is by document text, not identity, so cross-database reuse is
/// safe by construction.
pub fn document_cache() -> &'static DocumentCache {
    static CACHE: OnceLock<DocumentCache> = OnceLock::new();
    CACHE.get_or_init(|| DocumentCache::with_capacity(DOCUMENT_CACHE_CAPACITY))
}
