//! Patient-Forum Testimony Ingestion
//!
//! A two-stage pipeline that crawls patient forums into a content-addressed
//! store, then turns the stored threads into validated, evidence-grounded
//! case records.
//!
//! # Design Philosophy
//!
//! - The ledger is the source of truth: every URL is pending, in progress,
//!   done or failed, and a killed run resumes from where it stopped
//! - Bodies are stored once per content hash, with provenance kept separately
//! - The reasoner never sees a whole document; it asks for overviews, reads
//!   and searches, and may only cite what it actually read
//! - Nothing invalid is written: records pass schema validation first
//!
//! # Usage
//!
//! ```rust,ignore
//! use testimony::{FetchPool, ExtractionStage, MemoryLedger, FsRawStore, FsRecordStore};
//! use testimony::testing::{MockCrawler, MockReasoner};
//!
//! let pool = FetchPool::new(ledger, crawler, raw.clone(), FetchConfig::default())?
//!     .with_sources(SourceRegistry::from_json(&sources_json)?);
//! pool.seed().await?;
//! let crawl = pool.run(cancel.clone()).await?;
//!
//! let stage = ExtractionStage::new(reasoner, raw, records, ExtractConfig::default())?;
//! let extract = stage.run(&cancel).await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Core trait abstractions (Ledger, RawStore, RecordStore, Crawler, Reasoner)
//! - [`types`] - Entries, documents, records and configuration
//! - [`ledger`] - Ledger implementations (MemoryLedger, SqliteLedger)
//! - [`stores`] - Raw document and record stores (memory, filesystem)
//! - [`crawlers`] - Crawler implementations, robots.txt and throttling
//! - [`discovery`] - URL canonicalization, link scoring and content inspection
//! - [`pipeline`] - Fetch pool, context materializer, agent and validator
//! - [`security`] - Credential handling
//! - [`testing`] - Mock implementations for testing

pub mod crawlers;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod security;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use error::{
    ConfigError, CrawlError, FailureClass, LedgerError, PipelineError, ReasonError, Result,
    SecurityError, StoreError,
};
pub use ledger::{maintain, MaintenanceReport, MemoryLedger};
#[cfg(feature = "sqlite")]
pub use ledger::SqliteLedger;
pub use pipeline::{
    validate_draft, validate_record, AgentPhase, CrawlSummary, ExtractionAgent, ExtractionStage,
    ExtractionSummary, FetchPool, MaterializedContext, UnitOutcome, ValidationContext,
};
pub use stores::{read_batch_file, FsRawStore, FsRecordStore, MemoryRawStore, MemoryRecordStore};
pub use traits::{
    crawler::{Crawler, UrlValidator, ValidatedCrawler},
    ledger::{Canonicalizer, DenyRule, Ledger, RequeueSelector},
    reasoner::{Action, DraftRequest, ExploreRequest, Observation, Reasoner},
    store::{RawStore, RecordStore},
};
pub use types::{
    config::{AgentConfig, ContextConfig, ExtractConfig, FetchConfig, FieldLimits, RetryPolicy},
    document::{FetchedPage, ProvenanceLink, RawDocument},
    entry::{
        Claim, EnqueueOutcome, EntryStatus, FailureKind, LeaseToken, LedgerEntry, NewEntry,
        StatusCounts,
    },
    record::{
        Draft, EvidenceSpan, FieldViolation, Onset, Rejection, RejectionReason, StructuredRecord,
        ViolationKind,
    },
    source::{SourceRegistry, SourceSeed},
};
