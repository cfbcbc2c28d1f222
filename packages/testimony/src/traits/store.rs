//! Storage traits for raw bodies and finished records.
//!
//! Both stores are keyed by content or identity, so concurrent writes of
//! the same key are idempotent and need no locking across stages.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{
    document::{ProvenanceLink, RawDocument},
    record::{Rejection, StructuredRecord},
};

/// Content-addressed store of fetched bodies.
///
/// There is no update and no delete. A body is stored once per distinct
/// canonical content; every source that produced it gets a provenance link.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Store a body and return its content hash.
    ///
    /// Storing identical content again returns the same hash and adds a
    /// provenance link if `source_id` is new for it.
    async fn put(&self, source_id: &str, body: &str) -> StoreResult<String>;

    /// Fetch a stored document. `StoreError::NotFound` if absent.
    async fn get(&self, content_hash: &str) -> StoreResult<RawDocument>;

    /// Check whether a hash is stored.
    async fn exists(&self, content_hash: &str) -> StoreResult<bool>;

    /// Every source recorded for a hash, oldest first.
    async fn sources(&self, content_hash: &str) -> StoreResult<Vec<ProvenanceLink>>;

    /// All stored hashes, sorted.
    async fn list_hashes(&self) -> StoreResult<Vec<String>>;
}

/// Store of validated records, one batch per source document.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write records for a source.
    ///
    /// A record whose `(source_hash, index)` already exists overwrites it.
    /// Writing an empty slice marks the source as processed with no cases.
    /// Any rejection previously recorded for the source is cleared.
    async fn put_records(&self, source_hash: &str, records: &[StructuredRecord])
        -> StoreResult<()>;

    /// Records for a source, ordered by index.
    async fn records(&self, source_hash: &str) -> StoreResult<Vec<StructuredRecord>>;

    /// Whether the source has been processed successfully.
    async fn has_records(&self, source_hash: &str) -> StoreResult<bool>;

    /// Processed sources, sorted.
    async fn list_sources(&self) -> StoreResult<Vec<String>>;

    /// Record that a unit was given up on.
    ///
    /// The rejection is stored under every source hash in the unit, so each
    /// document reports it until that document is accepted.
    async fn record_rejection(&self, rejection: &Rejection) -> StoreResult<()>;

    /// The rejection currently recorded for one source, if any.
    async fn rejection(&self, source_hash: &str) -> StoreResult<Option<Rejection>>;

    /// All recorded rejections, one per unit still referenced by a source.
    async fn rejections(&self) -> StoreResult<Vec<Rejection>>;
}
