//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::traits::store::{RawStore, RecordStore};
use crate::types::{
    document::{canonicalize_body, hash_content, ProvenanceLink, RawDocument},
    record::{Rejection, StructuredRecord},
};

struct StoredBody {
    body: String,
    links: Vec<ProvenanceLink>,
}

/// In-memory raw document store.
///
/// Not suitable for production as data is lost on restart.
pub struct MemoryRawStore {
    bodies: RwLock<HashMap<String, StoredBody>>,
}

impl Default for MemoryRawStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRawStore {
    pub fn new() -> Self {
        Self {
            bodies: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of distinct bodies stored.
    pub fn len(&self) -> usize {
        self.bodies.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RawStore for MemoryRawStore {
    async fn put(&self, source_id: &str, body: &str) -> StoreResult<String> {
        let body = canonicalize_body(body);
        if body.is_empty() {
            return Err(StoreError::EmptyBody {
                source_id: source_id.to_string(),
            });
        }
        let hash = hash_content(&body);

        let mut bodies = self.bodies.write().unwrap();
        let stored = bodies.entry(hash.clone()).or_insert_with(|| StoredBody {
            body,
            links: Vec::new(),
        });
        if !stored.links.iter().any(|l| l.source_id == source_id) {
            stored.links.push(ProvenanceLink {
                source_id: source_id.to_string(),
                fetched_at: Utc::now(),
            });
        }
        Ok(hash)
    }

    async fn get(&self, content_hash: &str) -> StoreResult<RawDocument> {
        let bodies = self.bodies.read().unwrap();
        let stored = bodies.get(content_hash).ok_or_else(|| StoreError::NotFound {
            key: content_hash.to_string(),
        })?;
        let first = &stored.links[0];

        Ok(RawDocument {
            content_hash: content_hash.to_string(),
            source_id: first.source_id.clone(),
            fetched_at: first.fetched_at,
            body: stored.body.clone(),
        })
    }

    async fn exists(&self, content_hash: &str) -> StoreResult<bool> {
        Ok(self.bodies.read().unwrap().contains_key(content_hash))
    }

    async fn sources(&self, content_hash: &str) -> StoreResult<Vec<ProvenanceLink>> {
        Ok(self
            .bodies
            .read()
            .unwrap()
            .get(content_hash)
            .map(|stored| stored.links.clone())
            .unwrap_or_default())
    }

    async fn list_hashes(&self) -> StoreResult<Vec<String>> {
        let mut hashes: Vec<String> = self.bodies.read().unwrap().keys().cloned().collect();
        hashes.sort();
        Ok(hashes)
    }
}

/// In-memory record store.
pub struct MemoryRecordStore {
    batches: RwLock<BTreeMap<String, BTreeMap<u32, StructuredRecord>>>,
    rejections: RwLock<BTreeMap<String, Rejection>>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(BTreeMap::new()),
            rejections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Total records across all sources.
    pub fn record_count(&self) -> usize {
        self.batches.read().unwrap().values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_records(
        &self,
        source_hash: &str,
        records: &[StructuredRecord],
    ) -> StoreResult<()> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches.entry(source_hash.to_string()).or_default();
        for record in records {
            batch.insert(record.index, record.clone());
        }
        drop(batches);

        self.rejections.write().unwrap().remove(source_hash);
        Ok(())
    }

    async fn records(&self, source_hash: &str) -> StoreResult<Vec<StructuredRecord>> {
        Ok(self
            .batches
            .read()
            .unwrap()
            .get(source_hash)
            .map(|batch| batch.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn has_records(&self, source_hash: &str) -> StoreResult<bool> {
        Ok(self.batches.read().unwrap().contains_key(source_hash))
    }

    async fn list_sources(&self) -> StoreResult<Vec<String>> {
        Ok(self.batches.read().unwrap().keys().cloned().collect())
    }

    async fn record_rejection(&self, rejection: &Rejection) -> StoreResult<()> {
        let mut rejections = self.rejections.write().unwrap();
        for key in &rejection.source_hashes {
            rejections.insert(key.clone(), rejection.clone());
        }
        Ok(())
    }

    async fn rejection(&self, source_hash: &str) -> StoreResult<Option<Rejection>> {
        Ok(self.rejections.read().unwrap().get(source_hash).cloned())
    }

    async fn rejections(&self) -> StoreResult<Vec<Rejection>> {
        let mut seen = BTreeSet::new();
        Ok(self
            .rejections
            .read()
            .unwrap()
            .values()
            .filter(|r| seen.insert(r.source_hashes.clone()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record::{Onset, RejectionReason};

    fn record(hash: &str, index: u32, condition: &str) -> StructuredRecord {
        StructuredRecord {
            source_hash: hash.to_string(),
            index,
            condition: condition.to_string(),
            onset: Onset::Unknown,
            threat_to_personhood: "t".to_string(),
            description: "d".to_string(),
            narrative_fragment: "n".to_string(),
            compensatory_rituals: None,
            source_url: None,
            evidence: vec![(0..1).into()],
        }
    }

    #[tokio::test]
    async fn test_identical_content_is_stored_once() {
        let store = MemoryRawStore::new();
        let a = store.put("https://a.example/1", "story\r\n").await.unwrap();
        let b = store.put("https://b.example/2", "story").await.unwrap();
        let again = store.put("https://a.example/1", "story").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a, again);
        assert_eq!(store.len(), 1);

        let sources = store.sources(&a).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source_id, "https://a.example/1");

        let doc = store.get(&a).await.unwrap();
        assert_eq!(doc.source_id, "https://a.example/1");
        assert_eq!(doc.body, "story");
    }

    #[tokio::test]
    async fn test_empty_body_is_refused() {
        let store = MemoryRawStore::new();
        let err = store.put("https://a.example/1", " \n\t\n").await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyBody { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_hash_is_not_found() {
        let store = MemoryRawStore::new();
        assert!(matches!(
            store.get("deadbeef").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(!store.exists("deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn test_records_overwrite_by_index() {
        let store = MemoryRecordStore::new();
        store
            .put_records("h", &[record("h", 1, "ME/CFS"), record("h", 0, "POTS")])
            .await
            .unwrap();
        store
            .put_records("h", &[record("h", 1, "Long COVID")])
            .await
            .unwrap();

        let records = store.records("h").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].condition, "POTS");
        assert_eq!(records[1].condition, "Long COVID");
    }

    #[tokio::test]
    async fn test_empty_batch_marks_source_processed_and_clears_rejection() {
        let store = MemoryRecordStore::new();
        store
            .record_rejection(&Rejection {
                source_hashes: vec!["h".into()],
                reason: RejectionReason::ValidationFailed,
                rounds_used: 3,
                draft_attempts: 3,
                violations: Vec::new(),
                detail: None,
            })
            .await
            .unwrap();
        assert_eq!(store.rejections().await.unwrap().len(), 1);

        store.put_records("h", &[]).await.unwrap();
        assert!(store.has_records("h").await.unwrap());
        assert!(store.records("h").await.unwrap().is_empty());
        assert!(store.rejections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unit_rejection_is_kept_for_every_document() {
        let store = MemoryRecordStore::new();
        let rejection = Rejection {
            source_hashes: vec!["a".into(), "b".into()],
            reason: RejectionReason::NothingGathered,
            rounds_used: 8,
            draft_attempts: 0,
            violations: Vec::new(),
            detail: None,
        };
        store.record_rejection(&rejection).await.unwrap();

        assert_eq!(store.rejection("a").await.unwrap(), Some(rejection.clone()));
        assert_eq!(store.rejection("b").await.unwrap(), Some(rejection.clone()));
        assert_eq!(store.rejections().await.unwrap(), vec![rejection.clone()]);

        // Accepting one document leaves the other still rejected
        store.put_records("a", &[]).await.unwrap();
        assert_eq!(store.rejection("a").await.unwrap(), None);
        assert_eq!(store.rejection("b").await.unwrap(), Some(rejection));
        assert_eq!(store.rejections().await.unwrap().len(), 1);

        store.put_records("b", &[]).await.unwrap();
        assert!(store.rejections().await.unwrap().is_empty());
    }
}
