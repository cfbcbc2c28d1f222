//! Reasoner trait - the language model behind the extraction agent.
//!
//! The agent never hands the reasoner a whole document. It describes the
//! context, lets the reasoner ask for overviews, reads and searches one at
//! a time, and finally asks for drafts grounded in what was read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ReasonResult;
use crate::pipeline::context::{DocumentInfo, Overview, SearchHit, Span};
use crate::types::record::{Draft, FieldViolation};

/// One exploration step chosen by the reasoner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Ask for the section structure
    Overview,
    /// Ask for the literal text of a byte range
    Read { start: usize, end: usize },
    /// Ask for matches of a pattern
    Search { pattern: String },
    /// Enough has been gathered; move on to drafting
    Finish,
}

/// The result of an executed exploration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Overview(Overview),
    Read(Span),
    Search { pattern: String, hits: Vec<SearchHit> },
    /// The reasoner's reply could not be turned into an action
    Invalid { reason: String },
}

/// Input to one exploration step.
#[derive(Debug, Clone, Copy)]
pub struct ExploreRequest<'a> {
    pub documents: &'a [DocumentInfo],
    /// Zero-based round about to be spent
    pub round: usize,
    pub max_rounds: usize,
    /// Everything observed so far, oldest first
    pub observations: &'a [Observation],
}

impl ExploreRequest<'_> {
    pub fn rounds_left(&self) -> usize {
        self.max_rounds.saturating_sub(self.round)
    }
}

/// Input to one drafting attempt.
#[derive(Debug, Clone, Copy)]
pub struct DraftRequest<'a> {
    pub documents: &'a [DocumentInfo],
    /// Every span gathered during exploration, sorted and merged
    pub spans: &'a [Span],
    /// Violations from the previous attempt; empty on the first
    pub violations: &'a [FieldViolation],
    /// Zero-based attempt number
    pub attempt: usize,
}

impl DraftRequest<'_> {
    pub fn is_repair(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// The reasoning capability.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Choose the next exploration step.
    async fn next_action(&self, request: &ExploreRequest<'_>) -> ReasonResult<Action>;

    /// Draft testimony cases from the gathered spans.
    ///
    /// Each draft cites the spans supporting it under `evidence` as
    /// `{"start", "end"}` context offsets.
    async fn draft(&self, request: &DraftRequest<'_>) -> ReasonResult<Vec<Draft>>;
}

#[async_trait]
impl<R: Reasoner + ?Sized> Reasoner for std::sync::Arc<R> {
    async fn next_action(&self, request: &ExploreRequest<'_>) -> ReasonResult<Action> {
        (**self).next_action(request).await
    }

    async fn draft(&self, request: &DraftRequest<'_>) -> ReasonResult<Vec<Draft>> {
        (**self).draft(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let action: Action =
            serde_json::from_str(r#"{"action": "read", "start": 10, "end": 90}"#).unwrap();
        assert_eq!(action, Action::Read { start: 10, end: 90 });

        let action: Action = serde_json::from_str(r#"{"action": "finish"}"#).unwrap();
        assert_eq!(action, Action::Finish);

        assert!(serde_json::from_str::<Action>(r#"{"action": "delete"}"#).is_err());
    }
}
