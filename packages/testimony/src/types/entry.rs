//! Ledger entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fetch status of a discovered document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Done => "done",
            EntryStatus::Failed => "failed",
        }
    }

    /// Terminal states are never left except by an explicit operator requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Done | EntryStatus::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "in_progress" => Ok(EntryStatus::InProgress),
            "done" => Ok(EntryStatus::Done),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown ledger status: {other}")),
        }
    }
}

/// One discovered document identifier and its fetch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Canonical URL; unique across the ledger
    pub id: String,

    /// Seed registry name this entry was discovered under
    pub source_name: String,

    /// Hops from the seed
    pub depth: u32,

    /// Claim ordering; higher first
    pub priority: i64,

    pub status: EntryStatus,

    /// Number of failed fetch attempts
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Set once the raw body is stored
    pub content_hash: Option<String>,

    pub discovered_at: DateTime<Utc>,

    /// Earliest time a pending entry may be claimed (retry backoff)
    pub available_at: DateTime<Utc>,

    /// Lease deadline while in progress
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// A request to add an identifier to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub id: String,
    pub source_name: String,
    pub depth: u32,
    pub priority: i64,
}

impl NewEntry {
    pub fn new(id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_name: source_name.into(),
            depth: 0,
            priority: 0,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    AlreadyPresent,
}

/// Opaque token proving ownership of an in-progress entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entry handed to a worker together with its lease.
#[derive(Debug, Clone)]
pub struct Claim {
    pub entry: LedgerEntry,
    pub lease: LeaseToken,
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Per-status entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Entries that still need a worker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress
    }

    pub(crate) fn bump(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Pending => self.pending += 1,
            EntryStatus::InProgress => self.in_progress += 1,
            EntryStatus::Done => self.done += 1,
            EntryStatus::Failed => self.failed += 1,
        }
    }
}
