//! The two pipeline stages and the pieces they are built from.
//!
//! - [`FetchPool`] - leased, throttled crawl of the document ledger
//! - [`ExtractionStage`] - runs the [`ExtractionAgent`] over stored documents
//! - [`MaterializedContext`] - the read-only view the agent explores
//! - [`validate_draft`] - schema validation of drafted cases

pub mod agent;
pub mod context;
pub mod extract;
pub mod fetch;
pub mod prompts;
pub mod validate;

pub use agent::{AgentPhase, ExtractionAgent, UnitOutcome};
pub use context::{DocumentInfo, MaterializedContext, Overview, SearchHit, SectionInfo, Span};
pub use extract::{ExtractionStage, ExtractionSummary};
pub use fetch::{CrawlSummary, FetchPool, DIRECTORY_PAGE};
pub use validate::{validate_draft, validate_record, ValidationContext};
