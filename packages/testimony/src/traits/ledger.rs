//! Ledger trait - durable fetch state for every discovered document.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::LedgerResult;
use crate::types::config::RetryPolicy;
use crate::types::entry::{
    Claim, EnqueueOutcome, EntryStatus, FailureKind, LeaseToken, LedgerEntry, NewEntry,
    StatusCounts,
};

/// Rewrites an id into its canonical form; `None` leaves the entry alone.
pub type Canonicalizer<'a> = &'a (dyn Fn(&str) -> Option<String> + Sync);

/// Whether an existing entry should be failed by a deny rule.
pub type DenyRule<'a> = &'a (dyn Fn(&LedgerEntry) -> bool + Sync);

/// Which failed entries an operator requeue applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueSelector {
    All,
    Ids(Vec<String>),
}

/// The single coordination point of the crawl stage.
///
/// Every state transition is durable before the call returns. Workers never
/// coordinate with each other directly; they only claim from and report to
/// the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Add an identifier if it is new.
    ///
    /// An existing entry is never duplicated. If it is still pending and the
    /// new priority is higher, the higher priority is adopted.
    async fn enqueue(&self, entry: NewEntry) -> LedgerResult<EnqueueOutcome>;

    /// Atomically move up to `n` claimable entries to in-progress.
    ///
    /// Claimable means pending and past its backoff, or in progress with an
    /// expired lease. No entry is handed to two concurrent callers.
    async fn claim_batch(&self, n: usize, lease: Duration) -> LedgerResult<Vec<Claim>>;

    /// Push the lease deadline of an in-progress entry to `now + duration`
    /// (heartbeat).
    ///
    /// An expired lease that nobody re-claimed can still be extended. Fails
    /// with a conflict once another claim owns the entry.
    async fn extend_lease(
        &self,
        id: &str,
        lease: &LeaseToken,
        duration: Duration,
    ) -> LedgerResult<()>;

    /// Mark an in-progress entry done. Fails with a conflict if the lease
    /// is no longer held.
    async fn complete(&self, id: &str, lease: &LeaseToken, content_hash: &str)
        -> LedgerResult<()>;

    /// Record a failed attempt.
    ///
    /// Permanent failures and transient failures at the ceiling of `retry`
    /// move the entry to failed; other transient failures return it to
    /// pending after the policy's backoff. Fails with a conflict if the
    /// lease is no longer held.
    async fn fail(
        &self,
        id: &str,
        lease: &LeaseToken,
        error: &str,
        kind: FailureKind,
        retry: &RetryPolicy,
    ) -> LedgerResult<EntryStatus>;

    /// Look up one entry.
    async fn get(&self, id: &str) -> LedgerResult<Option<LedgerEntry>>;

    /// Per-status counts.
    async fn counts(&self) -> LedgerResult<StatusCounts>;

    /// Entries in a given status, in claim order.
    async fn list(&self, status: EntryStatus, limit: usize) -> LedgerResult<Vec<LedgerEntry>>;

    /// Operator action: reset failed entries to pending with a fresh retry
    /// budget. Returns the number of entries requeued.
    async fn requeue_failed(&self, selector: RequeueSelector) -> LedgerResult<u64>;

    /// Maintenance: merge entries whose ids canonicalize to the same id.
    ///
    /// Groups holding an in-progress entry are left alone. The survivor
    /// keeps the best status (done, then pending, then failed), the highest
    /// priority and the shallowest depth. Returns the number of entries
    /// folded away or renamed.
    async fn normalize_ids(&self, canonicalize: Canonicalizer<'_>) -> LedgerResult<u64>;

    /// Maintenance: fail every pending or done entry matching `deny`,
    /// recording `reason`. Returns the number of entries failed.
    async fn apply_deny_filter(&self, deny: DenyRule<'_>, reason: &str) -> LedgerResult<u64>;

    /// Entries that still need a worker (pending or in progress).
    async fn outstanding(&self) -> LedgerResult<u64> {
        Ok(self.counts().await?.outstanding())
    }
}
