use crate::storage_key::StorageKey;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage key is required")]
    MissingKey,

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Internal store failure: {0}")]
    InternalFailure(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Acknowledgement of an accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    pub key: StorageKey,
    pub success: bool,
}

/// Listing entry for one retained upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub key: StorageKey,
    pub received_at: DateTime<Utc>,
    /// Encoded length / 1024, rounded. Overstates the raw size by roughly a third.
    pub approx_size_kb: u64,
}

/// A retained upload decoded back to its original bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: StorageKey,
    pub content_type: String,
    pub data: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Retained record for one upload
#[derive(Debug, Clone)]
struct StoredItem {
    /// `data:<content-type>;base64,<payload>`
    data_url: String,
    content_type: String,
    received_at: DateTime<Utc>,
    /// Write order, breaks `received_at` ties
    sequence: u64,
}

impl StoredItem {
    fn summary(&self, key: &StorageKey) -> UploadSummary {
        UploadSummary {
            key: key.clone(),
            received_at: self.received_at,
            approx_size_kb: approx_size_kb(self.data_url.len()),
        }
    }
}

/// Keyed holder of uploaded payloads.
///
/// Implementations must make each `put` all-or-nothing: a concurrent `list`
/// sees either the previous item for a key or the new one, never a partial write.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert or silently overwrite the item stored under `key`
    async fn put(&self, key: &str, content_type: &str, payload: Bytes) -> StoreResult<UploadAck>;

    /// Snapshot of every retained item, oldest first
    async fn list(&self) -> StoreResult<Vec<UploadSummary>>;

    /// Fetch one item decoded back to its original bytes
    async fn get(&self, key: &str) -> StoreResult<Option<StoredObject>>;

    /// Number of retained items
    async fn len(&self) -> usize;
}

/// Process-lifetime in-memory store
pub struct MemoryStore {
    items: RwLock<HashMap<StorageKey, StoredItem>>,
    sequence: AtomicU64,
    max_payload_bytes: usize,
}

impl MemoryStore {
    pub fn new(max_payload_bytes: usize) -> Self {
        info!(max_payload_bytes, "In-memory upload store initialized");

        Self {
            items: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            max_payload_bytes,
        }
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    #[instrument(skip(self, payload), fields(size_bytes = payload.len()))]
    async fn put(&self, key: &str, content_type: &str, payload: Bytes) -> StoreResult<UploadAck> {
        let key = StorageKey::parse(key).map_err(|_| StoreError::MissingKey)?;

        if payload.len() > self.max_payload_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        // Encode outside the lock so a failure leaves the map untouched
        let item = StoredItem {
            data_url: encode_data_url(content_type, &payload),
            content_type: content_type.to_string(),
            received_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        let total = {
            let mut items = self.items.write();
            let replaced = items.insert(key.clone(), item).is_some();
            if replaced {
                debug!(key = %key, "Overwrote existing upload");
            }
            items.len()
        };

        metrics::counter!("album_uploads_total").increment(1);
        metrics::counter!("album_upload_bytes_total").increment(payload.len() as u64);
        metrics::gauge!("album_items").set(total as f64);

        info!(key = %key, total_items = total, "Upload stored");

        Ok(UploadAck { key, success: true })
    }

    #[instrument(skip(self))]
    async fn list(&self) -> StoreResult<Vec<UploadSummary>> {
        let mut entries: Vec<(u64, UploadSummary)> = {
            let items = self.items.read();
            items
                .iter()
                .map(|(key, item)| (item.sequence, item.summary(key)))
                .collect()
        };

        // HashMap iteration order is arbitrary; rebuild chronological order
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            a.received_at.cmp(&b.received_at).then(seq_a.cmp(seq_b))
        });

        debug!(count = entries.len(), "Listed uploads");

        Ok(entries.into_iter().map(|(_, summary)| summary).collect())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<StoredObject>> {
        let key = StorageKey::parse(key).map_err(|_| StoreError::MissingKey)?;

        let item = match self.items.read().get(&key) {
            Some(item) => item.clone(),
            None => return Ok(None),
        };

        let data = decode_data_url(&item.data_url)?;

        Ok(Some(StoredObject {
            key,
            content_type: item.content_type,
            data,
            received_at: item.received_at,
        }))
    }

    async fn len(&self) -> usize {
        self.items.read().len()
    }
}

fn encode_data_url(content_type: &str, payload: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(payload))
}

fn decode_data_url(data_url: &str) -> StoreResult<Bytes> {
    let (_, encoded) = data_url
        .split_once(";base64,")
        .ok_or_else(|| StoreError::InternalFailure("stored item is not a base64 data URL".to_string()))?;

    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| StoreError::InternalFailure(format!("stored item failed to decode: {e}")))
}

/// Encoded length in KB, rounded half up
pub fn approx_size_kb(encoded_len: usize) -> u64 {
    (encoded_len as f64 / 1024.0).round() as u64
}
