//! In-memory ledger for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use super::{deadline, merge_entries, rewrite_groups};
use crate::error::{LedgerError, LedgerResult};
use crate::traits::ledger::{Canonicalizer, DenyRule, Ledger, RequeueSelector};
use crate::types::{
    config::RetryPolicy,
    entry::{
        Claim, EnqueueOutcome, EntryStatus, FailureKind, LeaseToken, LedgerEntry, NewEntry,
        StatusCounts,
    },
};

struct Row {
    entry: LedgerEntry,
    lease: Option<LeaseToken>,
    /// Insertion order, breaks ties between equal discovery times
    seq: u64,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<String, Row>,
    next_seq: u64,
}

/// In-memory ledger.
///
/// Same semantics as the SQLite ledger, but state is lost on restart.
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Number of entries in any status.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted<'a>(rows: impl Iterator<Item = &'a Row>) -> Vec<&'a Row> {
        let mut rows: Vec<&Row> = rows.collect();
        rows.sort_by(|a, b| {
            b.entry
                .priority
                .cmp(&a.entry.priority)
                .then(a.entry.discovered_at.cmp(&b.entry.discovered_at))
                .then(a.seq.cmp(&b.seq))
        });
        rows
    }

    /// Find the row for `id` and check that `lease` still owns it.
    fn owned<'a>(
        inner: &'a mut Inner,
        id: &str,
        lease: &LeaseToken,
    ) -> LedgerResult<&'a mut Row> {
        let row = inner
            .rows
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound { id: id.to_string() })?;

        if row.entry.status != EntryStatus::InProgress {
            return Err(LedgerError::Conflict {
                id: id.to_string(),
                reason: format!("entry is {}", row.entry.status),
            });
        }
        if row.lease.as_ref() != Some(lease) {
            return Err(LedgerError::Conflict {
                id: id.to_string(),
                reason: "lease was re-claimed".to_string(),
            });
        }
        Ok(row)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn enqueue(&self, new: NewEntry) -> LedgerResult<EnqueueOutcome> {
        let mut inner = self.inner.write().unwrap();

        if let Some(row) = inner.rows.get_mut(&new.id) {
            if row.entry.status == EntryStatus::Pending && new.priority > row.entry.priority {
                row.entry.priority = new.priority;
                row.entry.source_name = new.source_name;
            }
            return Ok(EnqueueOutcome::AlreadyPresent);
        }

        let now = Utc::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rows.insert(
            new.id.clone(),
            Row {
                entry: LedgerEntry {
                    id: new.id,
                    source_name: new.source_name,
                    depth: new.depth,
                    priority: new.priority,
                    status: EntryStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    content_hash: None,
                    discovered_at: now,
                    available_at: now,
                    lease_expires_at: None,
                },
                lease: None,
                seq,
            },
        );
        Ok(EnqueueOutcome::Inserted)
    }

    async fn claim_batch(&self, n: usize, lease: Duration) -> LedgerResult<Vec<Claim>> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let token = LeaseToken::generate();

        let ids: Vec<String> = Self::sorted(inner.rows.values().filter(|row| {
            match row.entry.status {
                EntryStatus::Pending => row.entry.available_at <= now,
                EntryStatus::InProgress => row.entry.lease_expires_at.is_some_and(|t| t <= now),
                _ => false,
            }
        }))
        .into_iter()
        .take(n)
        .map(|row| row.entry.id.clone())
        .collect();

        let mut claims = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = inner.rows.get_mut(&id) {
                row.entry.status = EntryStatus::InProgress;
                row.entry.lease_expires_at = Some(deadline(now, lease));
                row.lease = Some(token.clone());
                claims.push(Claim {
                    entry: row.entry.clone(),
                    lease: token.clone(),
                });
            }
        }
        Ok(claims)
    }

    async fn extend_lease(
        &self,
        id: &str,
        lease: &LeaseToken,
        duration: Duration,
    ) -> LedgerResult<()> {
        let mut inner = self.inner.write().unwrap();
        let row = Self::owned(&mut inner, id, lease)?;
        row.entry.lease_expires_at = Some(deadline(Utc::now(), duration));
        Ok(())
    }

    async fn complete(
        &self,
        id: &str,
        lease: &LeaseToken,
        content_hash: &str,
    ) -> LedgerResult<()> {
        let mut inner = self.inner.write().unwrap();
        let row = Self::owned(&mut inner, id, lease)?;

        row.entry.status = EntryStatus::Done;
        row.entry.content_hash = Some(content_hash.to_string());
        row.entry.last_error = None;
        row.entry.lease_expires_at = None;
        row.lease = None;
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        lease: &LeaseToken,
        error: &str,
        kind: FailureKind,
        retry: &RetryPolicy,
    ) -> LedgerResult<EntryStatus> {
        let mut inner = self.inner.write().unwrap();
        let row = Self::owned(&mut inner, id, lease)?;
        let now = Utc::now();

        row.entry.attempts += 1;
        row.entry.last_error = Some(error.to_string());
        row.entry.lease_expires_at = None;
        row.lease = None;

        if kind == FailureKind::Permanent || retry.exhausted(row.entry.attempts) {
            row.entry.status = EntryStatus::Failed;
        } else {
            row.entry.status = EntryStatus::Pending;
            row.entry.available_at = deadline(now, retry.delay_for(row.entry.attempts));
        }
        Ok(row.entry.status)
    }

    async fn get(&self, id: &str) -> LedgerResult<Option<LedgerEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.rows.get(id).map(|row| row.entry.clone()))
    }

    async fn counts(&self) -> LedgerResult<StatusCounts> {
        let inner = self.inner.read().unwrap();
        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            counts.bump(row.entry.status);
        }
        Ok(counts)
    }

    async fn list(&self, status: EntryStatus, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(
            Self::sorted(inner.rows.values().filter(|row| row.entry.status == status))
                .into_iter()
                .take(limit)
                .map(|row| row.entry.clone())
                .collect(),
        )
    }

    async fn requeue_failed(&self, selector: RequeueSelector) -> LedgerResult<u64> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let mut count = 0;

        let selected = |id: &str| match &selector {
            RequeueSelector::All => true,
            RequeueSelector::Ids(ids) => ids.iter().any(|candidate| candidate == id),
        };

        for row in inner.rows.values_mut() {
            if row.entry.status == EntryStatus::Failed && selected(&row.entry.id) {
                row.entry.status = EntryStatus::Pending;
                row.entry.attempts = 0;
                row.entry.available_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn normalize_ids(&self, canonicalize: Canonicalizer<'_>) -> LedgerResult<u64> {
        let mut inner = self.inner.write().unwrap();
        let entries = inner.rows.values().map(|row| row.entry.clone()).collect();
        let mut merged = 0;

        for (canonical, group) in rewrite_groups(entries, canonicalize) {
            let Some(entry) = merge_entries(canonical.clone(), &group) else {
                continue;
            };
            let mut seq = u64::MAX;
            for old in &group {
                if let Some(row) = inner.rows.remove(&old.id) {
                    seq = seq.min(row.seq);
                }
                if old.id != canonical {
                    merged += 1;
                }
            }
            inner.rows.insert(
                canonical,
                Row {
                    entry,
                    lease: None,
                    seq,
                },
            );
        }
        Ok(merged)
    }

    async fn apply_deny_filter(&self, deny: DenyRule<'_>, reason: &str) -> LedgerResult<u64> {
        let mut inner = self.inner.write().unwrap();
        let mut count = 0;

        for row in inner.rows.values_mut() {
            let eligible = matches!(row.entry.status, EntryStatus::Pending | EntryStatus::Done);
            if eligible && deny(&row.entry) {
                row.entry.status = EntryStatus::Failed;
                row.entry.last_error = Some(reason.to_string());
                count += 1;
            }
        }
        Ok(count)
    }
}
