//! In-process, append-only store of captured requests.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use time::OffsetDateTime;

/// Identifier of a captured request. Assigned in insertion order from 0.
pub type CaptureId = u64;

/// A request as seen by the proxy, recorded for later inspection or replay.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    pub id: CaptureId,
    #[serde(with = "http_serde::method")]
    pub method: Method,
    /// Absolute URL including scheme, authority, path and query.
    pub url: String,
    #[serde(with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// Raw body bytes, empty for bodiless requests.
    pub body: Bytes,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Thread-safe sink for captured requests.
///
/// Identifier assignment and insertion happen under a single write lock, so
/// readers never observe an identifier without its record. Records are
/// immutable once stored and handed out as shared `Arc`s.
#[derive(Debug, Default)]
pub struct CaptureStore {
    records: RwLock<Vec<Arc<CapturedRequest>>>,
}

impl CaptureStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request and returns its identifier.
    pub fn add(
        &self,
        method: Method,
        url: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> CaptureId {
        let url = url.into();
        let timestamp = OffsetDateTime::now_utc();

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = records.len() as CaptureId;
        records.push(Arc::new(CapturedRequest {
            id,
            method,
            url,
            headers,
            body,
            timestamp,
        }));
        id
    }

    /// Looks up a record by identifier.
    pub fn get(&self, id: CaptureId) -> Option<Arc<CapturedRequest>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let index = usize::try_from(id).ok()?;
        records.get(index).cloned()
    }

    /// Returns a snapshot of every record captured so far.
    pub fn list(&self) -> Vec<Arc<CapturedRequest>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
