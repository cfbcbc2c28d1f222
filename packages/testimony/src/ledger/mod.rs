//! Document ledger implementations.
//!
//! - [`MemoryLedger`] - In-memory ledger (for testing)
//! - [`SqliteLedger`] - Durable SQLite ledger (requires `sqlite` feature)

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::discovery::{canonicalize_url, is_denied_link};
use crate::error::LedgerResult;
use crate::traits::ledger::{Canonicalizer, Ledger};
use crate::types::entry::{EntryStatus, LedgerEntry};
use crate::types::source::SourceRegistry;

/// Reason recorded against entries failed by [`maintain`].
pub const DENIED_BY_FILTER: &str = "denied by link filter";

/// Longest delay we translate into a wall-clock deadline (ten years).
const MAX_DEADLINE_MS: u128 = 315_360_000_000;

/// `now + delay`, saturating at a far-future deadline.
pub(crate) fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let ms = delay.as_millis().min(MAX_DEADLINE_MS) as i64;
    now + chrono::Duration::milliseconds(ms)
}

/// Group entries by canonical id, keeping only groups that need rewriting.
///
/// A group needs rewriting when one of its ids is not canonical. Groups
/// holding an in-progress entry are skipped: a worker may still report
/// against the old id.
pub(crate) fn rewrite_groups(
    entries: Vec<LedgerEntry>,
    canonicalize: Canonicalizer<'_>,
) -> Vec<(String, Vec<LedgerEntry>)> {
    let mut groups: BTreeMap<String, Vec<LedgerEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(canonical) = canonicalize(&entry.id) {
            groups.entry(canonical).or_default().push(entry);
        }
    }

    groups
        .into_iter()
        .filter(|(canonical, group)| {
            group.iter().any(|e| &e.id != canonical)
                && group.iter().all(|e| e.status != EntryStatus::InProgress)
        })
        .collect()
}

/// Fold a group of entries sharing a canonical id into one.
///
/// Done beats pending beats failed; attempts, error, hash and backoff come
/// from the best row of the winning status.
pub(crate) fn merge_entries(id: String, group: &[LedgerEntry]) -> Option<LedgerEntry> {
    let status = if group.iter().any(|e| e.status == EntryStatus::Done) {
        EntryStatus::Done
    } else if group.iter().any(|e| !e.status.is_terminal()) {
        EntryStatus::Pending
    } else {
        EntryStatus::Failed
    };

    let best = group
        .iter()
        .filter(|e| e.status == status)
        .max_by_key(|e| e.priority)?;
    let top = group.iter().max_by_key(|e| e.priority)?;

    Some(LedgerEntry {
        id,
        source_name: top.source_name.clone(),
        depth: group.iter().map(|e| e.depth).min()?,
        priority: top.priority,
        status,
        attempts: best.attempts,
        last_error: best.last_error.clone(),
        content_hash: best.content_hash.clone(),
        discovered_at: group.iter().map(|e| e.discovered_at).min()?,
        available_at: best.available_at,
        lease_expires_at: None,
    })
}

/// Counts from one [`maintain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries folded into a canonical duplicate or renamed
    pub merged: u64,
    /// Entries failed by the deny rules
    pub denied: u64,
}

/// Bring a ledger written under older rules in line with the current
/// canonicalization and deny lists.
///
/// Hard-deny tokens apply to every entry; a seed's own deny tokens apply
/// to entries discovered under that seed.
pub async fn maintain<L: Ledger + ?Sized>(
    ledger: &L,
    sources: &SourceRegistry,
) -> LedgerResult<MaintenanceReport> {
    let merged = ledger.normalize_ids(&canonicalize_url).await?;

    let deny =
        |entry: &LedgerEntry| is_denied_link(&entry.id, sources.get(&entry.source_name));
    let denied = ledger.apply_deny_filter(&deny, DENIED_BY_FILTER).await?;

    tracing::info!(merged, denied, "Ledger maintenance finished");
    Ok(MaintenanceReport { merged, denied })
}

/// Behaviour every ledger implementation must share.
#[cfg(test)]
pub(crate) mod conformance {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::discovery::canonicalize_url;
    use crate::traits::ledger::{Ledger, RequeueSelector};
    use crate::types::config::RetryPolicy;
    use crate::types::entry::{EnqueueOutcome, EntryStatus, FailureKind, LedgerEntry, NewEntry};

    const LEASE: Duration = Duration::from_secs(60);

    fn retry() -> RetryPolicy {
        RetryPolicy::immediate(3)
    }

    pub async fn enqueue_is_idempotent(ledger: &impl Ledger) {
        let first = ledger.enqueue(NewEntry::new("https://a.example/1", "a")).await.unwrap();
        let second = ledger.enqueue(NewEntry::new("https://a.example/1", "a")).await.unwrap();

        assert_eq!(first, EnqueueOutcome::Inserted);
        assert_eq!(second, EnqueueOutcome::AlreadyPresent);
        assert_eq!(ledger.counts().await.unwrap().pending, 1);
    }

    pub async fn reenqueue_adopts_higher_priority(ledger: &impl Ledger) {
        let id = "https://a.example/story";
        ledger
            .enqueue(NewEntry::new(id, "source-a").with_priority(8))
            .await
            .unwrap();
        ledger
            .enqueue(NewEntry::new(id, "source-b").with_priority(20))
            .await
            .unwrap();
        ledger
            .enqueue(NewEntry::new(id, "source-c").with_priority(1))
            .await
            .unwrap();

        let entry = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(entry.priority, 20);
        assert_eq!(entry.source_name, "source-b");
    }

    pub async fn claim_is_exclusive_and_ordered(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("low", "s").with_priority(1)).await.unwrap();
        ledger.enqueue(NewEntry::new("high", "s").with_priority(9)).await.unwrap();

        let first = ledger.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].entry.id, "high");
        assert_eq!(first[0].entry.status, EntryStatus::InProgress);

        let second = ledger.claim_batch(5, LEASE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].entry.id, "low");

        assert!(ledger.claim_batch(5, LEASE).await.unwrap().is_empty());
        assert_eq!(ledger.counts().await.unwrap().in_progress, 2);
    }

    pub async fn complete_requires_current_lease(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("doc", "s")).await.unwrap();
        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);

        ledger.complete("doc", &claim.lease, "abc123").await.unwrap();
        let entry = ledger.get("doc").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Done);
        assert_eq!(entry.content_hash.as_deref(), Some("abc123"));

        let again = ledger.complete("doc", &claim.lease, "abc123").await.unwrap_err();
        assert!(again.is_conflict());

        let missing = ledger.complete("nope", &claim.lease, "abc123").await.unwrap_err();
        assert!(matches!(missing, crate::error::LedgerError::NotFound { .. }));
    }

    pub async fn expired_lease_is_reclaimed(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("doc", "s")).await.unwrap();
        let stale = ledger
            .claim_batch(1, Duration::from_millis(20))
            .await
            .unwrap()
            .remove(0);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let fresh = ledger.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_ne!(fresh[0].lease, stale.lease);

        let late = ledger.complete("doc", &stale.lease, "h").await.unwrap_err();
        assert!(late.is_conflict());

        ledger.complete("doc", &fresh[0].lease, "h").await.unwrap();
    }

    pub async fn transient_failures_retry_until_ceiling(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("flaky", "s")).await.unwrap();

        for attempt in 1..=3u32 {
            let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
            let status = ledger
                .fail("flaky", &claim.lease, "timeout", FailureKind::Transient, &retry())
                .await
                .unwrap();

            let entry = ledger.get("flaky").await.unwrap().unwrap();
            assert_eq!(entry.attempts, attempt);
            assert_eq!(entry.last_error.as_deref(), Some("timeout"));
            if attempt < 3 {
                assert_eq!(status, EntryStatus::Pending);
            } else {
                assert_eq!(status, EntryStatus::Failed);
            }
        }

        assert!(ledger.claim_batch(1, LEASE).await.unwrap().is_empty());
        assert_eq!(ledger.counts().await.unwrap().failed, 1);
    }

    pub async fn permanent_failure_is_terminal(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("gone", "s")).await.unwrap();
        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);

        let status = ledger
            .fail("gone", &claim.lease, "404", FailureKind::Permanent, &retry())
            .await
            .unwrap();
        assert_eq!(status, EntryStatus::Failed);

        let conflict = ledger
            .fail("gone", &claim.lease, "404", FailureKind::Permanent, &retry())
            .await
            .unwrap_err();
        assert!(conflict.is_conflict());
    }

    pub async fn requeue_resets_failed_entries(ledger: &impl Ledger) {
        for id in ["x", "y"] {
            ledger.enqueue(NewEntry::new(id, "s")).await.unwrap();
            let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
            ledger
                .fail(&claim.entry.id, &claim.lease, "boom", FailureKind::Permanent, &retry())
                .await
                .unwrap();
        }

        let listed = ledger.list(EntryStatus::Failed, 10).await.unwrap();
        assert_eq!(listed.len(), 2);

        let requeued = ledger
            .requeue_failed(RequeueSelector::Ids(vec!["x".into(), "missing".into()]))
            .await
            .unwrap();
        assert_eq!(requeued, 1);

        let x = ledger.get("x").await.unwrap().unwrap();
        assert_eq!(x.status, EntryStatus::Pending);
        assert_eq!(x.attempts, 0);

        assert_eq!(
            ledger.requeue_failed(RequeueSelector::All).await.unwrap(),
            1
        );
        assert_eq!(ledger.counts().await.unwrap().failed, 0);
    }

    pub async fn retry_policy_comes_from_the_caller(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("flaky", "s")).await.unwrap();
        let once = RetryPolicy::immediate(1);

        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
        let status = ledger
            .fail("flaky", &claim.lease, "timeout", FailureKind::Transient, &once)
            .await
            .unwrap();
        assert_eq!(status, EntryStatus::Failed);
    }

    pub async fn extended_lease_is_not_reclaimed(ledger: &impl Ledger) {
        ledger.enqueue(NewEntry::new("slow", "s")).await.unwrap();
        let claim = ledger
            .claim_batch(1, Duration::from_millis(150))
            .await
            .unwrap()
            .remove(0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        ledger
            .extend_lease("slow", &claim.lease, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(ledger.claim_batch(1, LEASE).await.unwrap().is_empty());
        let entry = ledger.get("slow").await.unwrap().unwrap();
        assert!(entry.lease_expires_at.unwrap() > chrono::Utc::now());
        ledger.complete("slow", &claim.lease, "h").await.unwrap();

        // A lease taken over by another claim can no longer be extended
        ledger.enqueue(NewEntry::new("stolen", "s")).await.unwrap();
        let stale = ledger
            .claim_batch(1, Duration::from_millis(20))
            .await
            .unwrap()
            .remove(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = ledger.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(fresh.len(), 1);

        let err = ledger
            .extend_lease("stolen", &stale.lease, LEASE)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let done = ledger
            .extend_lease("slow", &claim.lease, LEASE)
            .await
            .unwrap_err();
        assert!(done.is_conflict());
    }

    pub async fn normalize_merges_canonical_duplicates(ledger: &impl Ledger) {
        let slash = "https://example.org/threads/story.1/";
        let canonical = "https://example.org/threads/story.1";

        ledger
            .enqueue(NewEntry::new(slash, "source-a").with_priority(5))
            .await
            .unwrap();
        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
        ledger.complete(slash, &claim.lease, "h1").await.unwrap();

        ledger
            .enqueue(NewEntry::new(canonical, "source-b").with_priority(9).with_depth(0))
            .await
            .unwrap();
        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
        ledger
            .fail(canonical, &claim.lease, "502", FailureKind::Permanent, &retry())
            .await
            .unwrap();

        ledger
            .enqueue(NewEntry::new("https://example.org/threads/other.2?utm_source=x", "source-a"))
            .await
            .unwrap();

        let busy = "https://example.org/threads/busy.3/";
        ledger
            .enqueue(NewEntry::new(busy, "source-a").with_priority(50))
            .await
            .unwrap();
        let held = ledger.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(held[0].entry.id, busy);

        let merged = ledger.normalize_ids(&canonicalize_url).await.unwrap();
        assert_eq!(merged, 2);

        let entry = ledger.get(canonical).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Done);
        assert_eq!(entry.content_hash.as_deref(), Some("h1"));
        assert_eq!(entry.priority, 9);
        assert_eq!(entry.source_name, "source-b");
        assert!(ledger.get(slash).await.unwrap().is_none());

        let renamed = ledger
            .get("https://example.org/threads/other.2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.status, EntryStatus::Pending);
        assert_eq!(
            ledger.get(busy).await.unwrap().unwrap().status,
            EntryStatus::InProgress
        );
        assert_eq!(ledger.counts().await.unwrap().total(), 3);

        assert_eq!(ledger.normalize_ids(&canonicalize_url).await.unwrap(), 0);
    }

    pub async fn deny_filter_fails_existing_entries(ledger: &impl Ledger) {
        let rules = "https://forum.example/threads/forum-rules.2";
        ledger.enqueue(NewEntry::new(rules, "s")).await.unwrap();
        let claim = ledger.claim_batch(1, LEASE).await.unwrap().remove(0);
        ledger.complete(rules, &claim.lease, "h").await.unwrap();

        let news = "https://forum.example/threads/news-in-brief-february-2026.48741";
        let story = "https://forum.example/threads/my-story.9";
        let held = "https://forum.example/threads/announcement.3";
        for id in [news, story] {
            ledger.enqueue(NewEntry::new(id, "s")).await.unwrap();
        }
        ledger
            .enqueue(NewEntry::new(held, "s").with_priority(50))
            .await
            .unwrap();
        assert_eq!(ledger.claim_batch(1, LEASE).await.unwrap()[0].entry.id, held);

        let deny = |entry: &LedgerEntry| {
            ["forum-rules", "news-in-brief", "announcement"]
                .iter()
                .any(|t| entry.id.contains(t))
        };
        let denied = ledger.apply_deny_filter(&deny, "denied").await.unwrap();
        assert_eq!(denied, 2);

        for id in [rules, news] {
            let entry = ledger.get(id).await.unwrap().unwrap();
            assert_eq!(entry.status, EntryStatus::Failed);
            assert_eq!(entry.last_error.as_deref(), Some("denied"));
        }
        assert_eq!(
            ledger.get(story).await.unwrap().unwrap().status,
            EntryStatus::Pending
        );
        assert_eq!(
            ledger.get(held).await.unwrap().unwrap().status,
            EntryStatus::InProgress
        );
    }

    pub async fn concurrent_claims_never_overlap<L: Ledger + 'static>(ledger: Arc<L>) {
        for i in 0..60 {
            ledger
                .enqueue(NewEntry::new(format!("https://a.example/{i}"), "s"))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claims = ledger.claim_batch(3, LEASE).await.unwrap();
                    if claims.is_empty() {
                        break;
                    }
                    mine.extend(claims.into_iter().map(|c| c.entry.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id.clone()), "{id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 60);
    }
}
