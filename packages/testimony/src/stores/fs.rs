//! Filesystem storage.
//!
//! Layout under the raw root:
//! - `<hash>.md` - canonical body
//! - `links/<hash>/<sha256(source_id)>.json` - one provenance link per source
//!
//! Layout under the output root:
//! - `<source_hash>.json` - `{"source_hash": ..., "cases": [...]}`
//! - `.rejected/<source_hash>.json` - the last rejection of a unit holding the source
//!
//! Every file is written to a temp file in the target directory and renamed
//! into place, so readers never see a partial file.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::pipeline::validate::validate_record;
use crate::traits::store::{RawStore, RecordStore};
use crate::types::{
    config::FieldLimits,
    document::{canonicalize_body, hash_content, ProvenanceLink, RawDocument},
    record::{Rejection, StructuredRecord},
};

const BODY_EXT: &str = "md";
const BATCH_EXT: &str = "json";
const LINKS_DIR: &str = "links";
const REJECTED_DIR: &str = ".rejected";

fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Write `bytes` to `path` atomically.
///
/// With `clobber` false an existing file is left untouched and `Ok(false)`
/// is returned.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>, clobber: bool) -> StoreResult<bool> {
    tokio::task::spawn_blocking(move || -> StoreResult<bool> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        if clobber {
            tmp.persist(&path).map_err(|e| e.error)?;
            return Ok(true);
        }
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn to_pretty_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read a directory, treating a missing directory as empty.
async fn dir_entries(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Stems of `<64 hex>.<ext>` files in a directory, sorted.
async fn hashes_with_ext(dir: &Path, ext: &str) -> StoreResult<Vec<String>> {
    Ok(dir_entries(dir)
        .await?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .filter_map(|p| p.file_stem()?.to_str().map(str::to_string))
        .filter(|stem| is_hash(stem))
        .collect())
}

/// Raw document store backed by a directory.
#[derive(Debug, Clone)]
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn body_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.{BODY_EXT}"))
    }

    fn links_dir(&self, hash: &str) -> PathBuf {
        self.root.join(LINKS_DIR).join(hash)
    }
}

#[async_trait]
impl RawStore for FsRawStore {
    async fn put(&self, source_id: &str, body: &str) -> StoreResult<String> {
        let body = canonicalize_body(body);
        if body.is_empty() {
            return Err(StoreError::EmptyBody {
                source_id: source_id.to_string(),
            });
        }
        let hash = hash_content(&body);

        // Link first: a body on disk always has at least one source.
        let link = ProvenanceLink {
            source_id: source_id.to_string(),
            fetched_at: Utc::now(),
        };
        let link_path = self
            .links_dir(&hash)
            .join(format!("{}.json", hash_content(source_id)));
        write_atomic(link_path, to_pretty_json(&link)?, false).await?;

        write_atomic(self.body_path(&hash), body.into_bytes(), false).await?;
        Ok(hash)
    }

    async fn get(&self, content_hash: &str) -> StoreResult<RawDocument> {
        if !is_hash(content_hash) {
            return Err(StoreError::NotFound {
                key: content_hash.to_string(),
            });
        }

        let body = match tokio::fs::read_to_string(self.body_path(content_hash)).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: content_hash.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let first = self
            .sources(content_hash)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Corrupt {
                path: self.links_dir(content_hash).display().to_string(),
                reason: "no provenance links".to_string(),
            })?;

        Ok(RawDocument {
            content_hash: content_hash.to_string(),
            source_id: first.source_id,
            fetched_at: first.fetched_at,
            body,
        })
    }

    async fn exists(&self, content_hash: &str) -> StoreResult<bool> {
        if !is_hash(content_hash) {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.body_path(content_hash)).await?)
    }

    async fn sources(&self, content_hash: &str) -> StoreResult<Vec<ProvenanceLink>> {
        if !is_hash(content_hash) {
            return Ok(Vec::new());
        }

        let mut links = Vec::new();
        for path in dir_entries(&self.links_dir(content_hash)).await? {
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ProvenanceLink>(&bytes) {
                Ok(link) => links.push(link),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable provenance link"),
            }
        }

        links.sort_by(|a, b| {
            a.fetched_at
                .cmp(&b.fetched_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        Ok(links)
    }

    async fn list_hashes(&self) -> StoreResult<Vec<String>> {
        hashes_with_ext(&self.root, BODY_EXT).await
    }
}

/// On-disk shape of one source's records.
#[derive(Debug, Serialize, Deserialize)]
struct BatchFile {
    source_hash: String,
    cases: Vec<StructuredRecord>,
}

/// An entry of a batch file that could not be read as a valid record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Position within the file's `cases` array
    pub position: usize,
    pub reason: String,
}

/// Read a batch file, keeping every valid record.
///
/// Entries that fail to decode or re-validate are reported as skipped
/// rather than failing the whole file. A file that is not a batch at all is
/// [`StoreError::Corrupt`].
pub async fn read_batch_file(
    path: &Path,
) -> StoreResult<(Vec<StructuredRecord>, Vec<SkippedEntry>)> {
    let bytes = tokio::fs::read(path).await?;
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.display().to_string(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    let source_hash = value
        .get("source_hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| corrupt("missing source_hash".to_string()))?;
    let cases = value
        .get("cases")
        .and_then(|v| v.as_array())
        .ok_or_else(|| corrupt("missing cases array".to_string()))?;

    let limits = FieldLimits::default();
    let mut records = Vec::new();
    let mut skipped = Vec::new();

    for (position, case) in cases.iter().enumerate() {
        let record: StructuredRecord = match serde_json::from_value(case.clone()) {
            Ok(record) => record,
            Err(e) => {
                skipped.push(SkippedEntry {
                    position,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if record.source_hash != source_hash {
            skipped.push(SkippedEntry {
                position,
                reason: format!("belongs to {}", record.source_hash),
            });
            continue;
        }

        let violations = validate_record(&record, &limits);
        if violations.is_empty() {
            records.push(record);
        } else {
            skipped.push(SkippedEntry {
                position,
                reason: violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }
    }

    Ok((records, skipped))
}

/// Record store backed by a directory of JSON batch files.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the batch file for a source.
    pub fn batch_path(&self, source_hash: &str) -> PathBuf {
        self.root.join(format!("{source_hash}.{BATCH_EXT}"))
    }

    fn rejection_path(&self, source_hash: &str) -> PathBuf {
        self.root
            .join(REJECTED_DIR)
            .join(format!("{source_hash}.json"))
    }

    fn check_key(source_hash: &str) -> StoreResult<()> {
        if is_hash(source_hash) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                key: source_hash.to_string(),
            })
        }
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn put_records(
        &self,
        source_hash: &str,
        records: &[StructuredRecord],
    ) -> StoreResult<()> {
        Self::check_key(source_hash)?;

        let mut merged: BTreeMap<u32, StructuredRecord> = self
            .records(source_hash)
            .await?
            .into_iter()
            .map(|r| (r.index, r))
            .collect();
        for record in records {
            merged.insert(record.index, record.clone());
        }

        let batch = BatchFile {
            source_hash: source_hash.to_string(),
            cases: merged.into_values().collect(),
        };
        write_atomic(self.batch_path(source_hash), to_pretty_json(&batch)?, true).await?;

        match tokio::fs::remove_file(self.rejection_path(source_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn records(&self, source_hash: &str) -> StoreResult<Vec<StructuredRecord>> {
        if !is_hash(source_hash) {
            return Ok(Vec::new());
        }
        let path = self.batch_path(source_hash);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let (records, skipped) = read_batch_file(&path).await?;
        for entry in &skipped {
            warn!(
                path = %path.display(),
                position = entry.position,
                reason = %entry.reason,
                "Skipping invalid record"
            );
        }
        Ok(records)
    }

    async fn has_records(&self, source_hash: &str) -> StoreResult<bool> {
        if !is_hash(source_hash) {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.batch_path(source_hash)).await?)
    }

    async fn list_sources(&self) -> StoreResult<Vec<String>> {
        hashes_with_ext(&self.root, BATCH_EXT).await
    }

    async fn record_rejection(&self, rejection: &Rejection) -> StoreResult<()> {
        if rejection.source_hashes.is_empty() {
            return Err(StoreError::NotFound {
                key: "<empty unit>".to_string(),
            });
        }
        for key in &rejection.source_hashes {
            Self::check_key(key)?;
        }

        let contents = to_pretty_json(rejection)?;
        for key in &rejection.source_hashes {
            write_atomic(self.rejection_path(key), contents.clone(), true).await?;
        }
        Ok(())
    }

    async fn rejection(&self, source_hash: &str) -> StoreResult<Option<Rejection>> {
        if !is_hash(source_hash) {
            return Ok(None);
        }
        let path = self.rejection_path(source_hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Rejection>(&bytes) {
                Ok(rejection) => Ok(Some(rejection)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable rejection");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn rejections(&self) -> StoreResult<Vec<Rejection>> {
        let mut seen = BTreeSet::new();
        let mut rejections = Vec::new();
        for path in dir_entries(&self.root.join(REJECTED_DIR)).await? {
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Rejection>(&bytes) {
                Ok(rejection) => {
                    if seen.insert(rejection.source_hashes.clone()) {
                        rejections.push(rejection);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable rejection"),
            }
        }
        Ok(rejections)
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
            onset: Onset::Since(2019),
            threat_to_personhood: "I stopped recognising myself".to_string(),
            description: "Years of post-exertional crashes".to_string(),
            narrative_fragment: "I used to run marathons.".to_string(),
            compensatory_rituals: Some("pacing with a heart-rate monitor".to_string()),
            source_url: Some("https://forum.example/threads/1".to_string()),
            evidence: vec![(0..24).into()],
        }
    }

    #[tokio::test]
    async fn test_put_is_content_addressed_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRawStore::new(dir.path());

        let a = store.put("https://a.example/1", "Body\r\n").await.unwrap();
        let b = store.put("https://b.example/2", "Body").await.unwrap();
        let again = store.put("https://a.example/1", "Body").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, again);

        assert_eq!(store.list_hashes().await.unwrap(), vec![a.clone()]);
        assert_eq!(store.sources(&a).await.unwrap().len(), 2);

        let on_disk = std::fs::read_to_string(dir.path().join(format!("{a}.md"))).unwrap();
        assert_eq!(on_disk, "Body");
        assert_eq!(hash_content(&on_disk), a);

        let doc = store.get(&a).await.unwrap();
        assert_eq!(doc.body, "Body");
    }

    #[tokio::test]
    async fn test_relink_keeps_first_fetch_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRawStore::new(dir.path());

        let hash = store.put("https://a.example/1", "Body").await.unwrap();
        let first = store.sources(&hash).await.unwrap()[0].fetched_at;
        store.put("https://a.example/1", "Body").await.unwrap();

        let links = store.sources(&hash).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].fetched_at, first);
    }

    #[tokio::test]
    async fn test_get_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRawStore::new(dir.path());

        assert!(matches!(
            store.get(&hash_content("nothing")).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            store.get("../etc/passwd").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(store.list_hashes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_batches_merge_and_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::new(dir.path());
        let hash = hash_content("source");

        store
            .put_records(&hash, &[record(&hash, 1, "POTS"), record(&hash, 0, "ME/CFS")])
            .await
            .unwrap();
        let first = std::fs::read(store.batch_path(&hash)).unwrap();

        store
            .put_records(&hash, &[record(&hash, 1, "POTS")])
            .await
            .unwrap();
        let second = std::fs::read(store.batch_path(&hash)).unwrap();
        assert_eq!(first, second);

        let records = store.records(&hash).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 0);
        assert_eq!(records[0].condition, "ME/CFS");
        assert_eq!(store.list_sources().await.unwrap(), vec![hash]);
    }

    #[tokio::test]
    async fn test_rejection_is_cleared_by_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::new(dir.path());
        let hash = hash_content("source");

        store
            .record_rejection(&Rejection {
                source_hashes: vec![hash.clone()],
                reason: RejectionReason::NothingGathered,
                rounds_used: 8,
                draft_attempts: 0,
                violations: Vec::new(),
                detail: None,
            })
            .await
            .unwrap();
        assert_eq!(store.rejections().await.unwrap().len(), 1);
        assert!(!store.has_records(&hash).await.unwrap());

        store.put_records(&hash, &[]).await.unwrap();
        assert!(store.rejections().await.unwrap().is_empty());
        assert!(store.has_records(&hash).await.unwrap());
        assert!(store.list_sources().await.unwrap().contains(&hash));
    }

    #[tokio::test]
    async fn test_unit_rejection_is_written_under_every_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::new(dir.path());
        let first = hash_content("first");
        let second = hash_content("second");
        let rejection = Rejection {
            source_hashes: vec![first.clone(), second.clone()],
            reason: RejectionReason::ValidationFailed,
            rounds_used: 4,
            draft_attempts: 3,
            violations: Vec::new(),
            detail: Some("condition missing".to_string()),
        };
        store.record_rejection(&rejection).await.unwrap();

        assert!(store.rejection_path(&first).exists());
        assert!(store.rejection_path(&second).exists());
        assert_eq!(store.rejection(&second).await.unwrap(), Some(rejection.clone()));
        assert_eq!(store.rejections().await.unwrap(), vec![rejection.clone()]);

        store.put_records(&first, &[]).await.unwrap();
        assert_eq!(store.rejection(&first).await.unwrap(), None);
        assert_eq!(store.rejection(&second).await.unwrap(), Some(rejection));

        store.put_records(&second, &[]).await.unwrap();
        assert!(store.rejections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_with_a_bad_hash_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::new(dir.path());
        let good = hash_content("good");

        let err = store
            .record_rejection(&Rejection {
                source_hashes: vec![good.clone(), "../escape".to_string()],
                reason: RejectionReason::Refused,
                rounds_used: 1,
                draft_attempts: 1,
                violations: Vec::new(),
                detail: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.rejection(&good).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_batch_file_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_content("source");
        let good = serde_json::to_value(record(&hash, 0, "ME/CFS")).unwrap();
        let mut blank = good.clone();
        blank["condition"] = serde_json::json!("   ");
        blank["index"] = serde_json::json!(1);

        let path = dir.path().join("batch.json");
        let file = serde_json::json!({
            "source_hash": hash,
            "cases": [good, {"index": "zero"}, blank],
        });
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let (records, skipped) = read_batch_file(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            skipped.iter().map(|s| s.position).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_read_batch_file_rejects_non_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();

        assert!(matches!(
            read_batch_file(&path).await.unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }
}
