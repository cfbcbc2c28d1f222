//! Recursive extraction agent.
//!
//! One agent run turns one extraction unit into records or a rejection:
//!
//! 1. **Exploring** - the reasoner spends a bounded number of rounds on
//!    overviews, reads and searches over the materialized context
//! 2. **Drafting** - the reasoner drafts cases from the spans it read
//! 3. **Validating** - drafts are grounded against the read spans, mapped
//!    back to their source document and checked by the schema validator
//! 4. **Repair** - violations are fed back for a bounded number of re-drafts
//!
//! The phases run strictly in sequence; nothing is written here.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use tracing::{debug, info, warn, Instrument};

use crate::error::{ConfigError, FailureClass, ReasonError, ReasonResult, Result};
use crate::pipeline::context::{MaterializedContext, Span};
use crate::pipeline::validate::{validate_draft, ValidationContext};
use crate::traits::reasoner::{Action, DraftRequest, ExploreRequest, Observation, Reasoner};
use crate::types::{
    config::AgentConfig,
    document::RawDocument,
    record::{
        Draft, EvidenceSpan, FieldViolation, Onset, Rejection, RejectionReason, StructuredRecord,
        ViolationKind,
    },
};

/// Fields that identify a case for de-duplication.
const ONTOLOGY_FIELDS: [&str; 5] = [
    "condition",
    "onset",
    "threat_to_personhood",
    "description",
    "narrative_fragment",
];

/// Where a unit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Exploring,
    Drafting,
    Validating,
    Accepted,
    Rejected,
}

/// Result of one agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Accepted {
        /// One record per distinct case, indexed per source document
        records: Vec<StructuredRecord>,
        rounds_used: usize,
        draft_attempts: usize,
    },
    Rejected(Rejection),
}

impl UnitOutcome {
    pub fn phase(&self) -> AgentPhase {
        match self {
            UnitOutcome::Accepted { .. } => AgentPhase::Accepted,
            UnitOutcome::Rejected(_) => AgentPhase::Rejected,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, UnitOutcome::Accepted { .. })
    }
}

/// Why a unit stopped before acceptance.
enum Stop {
    Reject(RejectionReason, Option<String>),
    Fatal(ReasonError),
}

impl Stop {
    /// A reasoner failure that survived the retry policy.
    fn from_reason(error: ReasonError) -> Self {
        if error.class() == FailureClass::Fatal {
            return Stop::Fatal(error);
        }
        let reason = match error {
            ReasonError::Refusal(_) => RejectionReason::Refused,
            _ => RejectionReason::ReasonerUnavailable,
        };
        Stop::Reject(reason, Some(error.to_string()))
    }
}

#[derive(Default)]
struct Progress {
    rounds_used: usize,
    draft_attempts: usize,
    violations: Vec<FieldViolation>,
}

/// The extraction agent.
///
/// # Example
///
/// ```rust,ignore
/// let agent = ExtractionAgent::new(reasoner, AgentConfig::default())?;
/// match agent.run(&documents).await? {
///     UnitOutcome::Accepted { records, .. } => store.put_records(hash, &records).await?,
///     UnitOutcome::Rejected(rejection) => store.record_rejection(&rejection).await?,
/// }
/// ```
pub struct ExtractionAgent<R> {
    reasoner: R,
    config: AgentConfig,
}

impl<R: Reasoner> ExtractionAgent<R> {
    /// Fails if the budgets make extraction impossible.
    pub fn new(reasoner: R, config: AgentConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { reasoner, config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one unit to acceptance or rejection.
    ///
    /// Only fatal reasoner failures (rejected credentials) are returned as
    /// errors; everything else ends in a [`UnitOutcome`].
    pub async fn run(&self, documents: &[RawDocument]) -> Result<UnitOutcome> {
        let span = tracing::info_span!(
            "unit",
            source = documents.first().map(|d| d.content_hash.as_str()).unwrap_or(""),
            documents = documents.len()
        );
        self.run_unit(documents).instrument(span).await
    }

    async fn run_unit(&self, documents: &[RawDocument]) -> Result<UnitOutcome> {
        let context = MaterializedContext::new(documents, self.config.context.clone());
        let mut progress = Progress::default();

        match self.extract(&context, &mut progress).await {
            Ok(records) => {
                info!(
                    records = records.len(),
                    rounds = progress.rounds_used,
                    attempts = progress.draft_attempts,
                    "Unit accepted"
                );
                Ok(UnitOutcome::Accepted {
                    records,
                    rounds_used: progress.rounds_used,
                    draft_attempts: progress.draft_attempts,
                })
            }
            Err(Stop::Reject(reason, detail)) => {
                warn!(
                    ?reason,
                    rounds = progress.rounds_used,
                    attempts = progress.draft_attempts,
                    violations = progress.violations.len(),
                    "Unit rejected"
                );
                Ok(UnitOutcome::Rejected(Rejection {
                    source_hashes: documents.iter().map(|d| d.content_hash.clone()).collect(),
                    reason,
                    rounds_used: progress.rounds_used,
                    draft_attempts: progress.draft_attempts,
                    violations: progress.violations,
                    detail,
                }))
            }
            Err(Stop::Fatal(error)) => Err(error.into()),
        }
    }

    async fn extract(
        &self,
        context: &MaterializedContext,
        progress: &mut Progress,
    ) -> std::result::Result<Vec<StructuredRecord>, Stop> {
        let gathered = self.explore(context, progress).await?;
        if gathered.is_empty() {
            return Err(Stop::Reject(RejectionReason::NothingGathered, None));
        }

        let spans: Vec<Span> = gathered.iter().map(|r| context.excerpt(r.clone())).collect();
        self.draft_until_valid(context, &gathered, &spans, progress)
            .await
    }

    /// Returns every range read, sorted and merged.
    async fn explore(
        &self,
        context: &MaterializedContext,
        progress: &mut Progress,
    ) -> std::result::Result<Vec<Range<usize>>, Stop> {
        debug!(phase = ?AgentPhase::Exploring, len = context.len(), "Exploring");
        let max_rounds = self.config.max_rounds;
        let mut observations: Vec<Observation> = Vec::new();
        let mut gathered: Vec<Range<usize>> = Vec::new();

        while progress.rounds_used < max_rounds {
            let request = ExploreRequest {
                documents: context.documents(),
                round: progress.rounds_used,
                max_rounds,
                observations: &observations,
            };
            let reply = {
                let request = &request;
                self.call(move || self.reasoner.next_action(request)).await
            };

            let action = match reply {
                Ok(action) => action,
                Err(ReasonError::Malformed(reason)) => {
                    warn!(%reason, "Unusable action, round spent");
                    progress.rounds_used += 1;
                    observations.push(Observation::Invalid { reason });
                    continue;
                }
                Err(e) => return Err(Stop::from_reason(e)),
            };

            let observation = match action {
                Action::Finish => {
                    debug!(rounds = progress.rounds_used, "Reasoner finished exploring");
                    break;
                }
                Action::Overview => Observation::Overview(context.overview()),
                Action::Read { start, end } => {
                    let span = context.read(start..end);
                    if !span.range.is_empty() {
                        gathered.push(span.range.clone());
                    }
                    Observation::Read(span)
                }
                Action::Search { pattern } => {
                    let hits = context.search(&pattern);
                    gathered.extend(hits.iter().map(|hit| hit.snippet_range.clone()));
                    Observation::Search { pattern, hits }
                }
            };
            progress.rounds_used += 1;
            observations.push(observation);
        }

        if progress.rounds_used >= max_rounds {
            debug!(max_rounds, "Exploration budget spent");
        }
        Ok(merge_ranges(gathered))
    }

    async fn draft_until_valid(
        &self,
        context: &MaterializedContext,
        gathered: &[Range<usize>],
        spans: &[Span],
        progress: &mut Progress,
    ) -> std::result::Result<Vec<StructuredRecord>, Stop> {
        let max_attempts = self.config.max_repair_rounds + 1;
        let validation = context.documents().iter().fold(
            ValidationContext::new(self.config.limits.clone()),
            |ctx, doc| ctx.with_source(&doc.content_hash, doc.range.len()),
        );

        loop {
            if progress.draft_attempts >= max_attempts {
                return Err(Stop::Reject(RejectionReason::ValidationFailed, None));
            }
            debug!(
                phase = ?AgentPhase::Drafting,
                attempt = progress.draft_attempts,
                spans = spans.len(),
                "Drafting"
            );

            let request = DraftRequest {
                documents: context.documents(),
                spans,
                violations: &progress.violations,
                attempt: progress.draft_attempts,
            };
            let reply = {
                let request = &request;
                self.call(move || self.reasoner.draft(request)).await
            };
            progress.draft_attempts += 1;

            let drafts = match reply {
                Ok(drafts) => drafts,
                Err(ReasonError::Malformed(reason)) => {
                    warn!(%reason, "Unusable drafts");
                    progress.violations =
                        vec![FieldViolation::new("reply", ViolationKind::Malformed { reason })];
                    continue;
                }
                Err(e) => return Err(Stop::from_reason(e)),
            };

            debug!(phase = ?AgentPhase::Validating, drafts = drafts.len(), "Validating");
            match validate_drafts(context, gathered, &validation, drafts) {
                Ok(records) => {
                    progress.violations.clear();
                    return Ok(records);
                }
                Err(violations) => {
                    warn!(
                        attempt = progress.draft_attempts,
                        violations = violations.len(),
                        "Drafts failed validation"
                    );
                    progress.violations = violations;
                }
            }
        }
    }

    /// One reasoner call under the timeout, retried on transient failure.
    async fn call<T, F, Fut>(&self, mut op: F) -> ReasonResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReasonResult<T>>,
    {
        let policy = &self.config.reasoner_retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::time::timeout(self.config.reasoner_timeout, op())
                .await
                .unwrap_or(Err(ReasonError::Timeout));

            match result {
                Err(e) if e.class() == FailureClass::Transient && !policy.exhausted(attempts) => {
                    let delay = policy.delay_for(attempts);
                    warn!(
                        attempt = attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Reasoner call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Sort ranges and merge the ones that overlap or touch.
fn merge_ranges(mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn dedupe_key(draft: &Draft) -> String {
    ONTOLOGY_FIELDS
        .iter()
        .map(|field| match draft.get(field) {
            Some(Value::String(s)) if *field == "onset" => {
                Onset::parse(s).map_or_else(|| normalize(s), |o| o.as_label())
            }
            Some(Value::String(s)) => normalize(s),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Collapse duplicates, ground, assign identity and validate every draft.
fn validate_drafts(
    context: &MaterializedContext,
    gathered: &[Range<usize>],
    validation: &ValidationContext,
    drafts: Vec<Draft>,
) -> std::result::Result<Vec<StructuredRecord>, Vec<FieldViolation>> {
    let mut unique: IndexMap<String, Draft> = IndexMap::new();
    for draft in drafts {
        unique.entry(dedupe_key(&draft)).or_insert(draft);
    }

    let mut next_index: HashMap<String, u32> = HashMap::new();
    let mut records = Vec::with_capacity(unique.len());
    let mut violations = Vec::new();

    for (case, draft) in unique.into_values().enumerate() {
        let (grounded, mut case_violations) = ground(context, gathered, draft, &mut next_index);
        let grounding_failed = !case_violations.is_empty();

        match validate_draft(&grounded, validation) {
            Ok(record) if !grounding_failed => records.push(record),
            Ok(_) => {}
            Err(found) => case_violations.extend(
                found
                    .into_iter()
                    .filter(|v| !(grounding_failed && v.field == "evidence")),
            ),
        }
        violations.extend(case_violations.into_iter().map(|v| v.for_case(case)));
    }

    if violations.is_empty() {
        Ok(records)
    } else {
        Err(violations)
    }
}

/// Check a draft's evidence against what was read and rewrite it in terms
/// of its source document.
///
/// Identity fields are always assigned here; whatever the reasoner put in
/// `source_hash`, `index` or `source_url` is replaced.
fn ground(
    context: &MaterializedContext,
    gathered: &[Range<usize>],
    mut draft: Draft,
    next_index: &mut HashMap<String, u32>,
) -> (Draft, Vec<FieldViolation>) {
    let mut violations = Vec::new();
    let mut document: Option<usize> = None;

    let cited = draft
        .get("evidence")
        .cloned()
        .map(serde_json::from_value::<Vec<EvidenceSpan>>);

    if let Some(Ok(spans)) = cited {
        let mut local = Vec::with_capacity(spans.len());
        for span in spans {
            let invalid = |reason: String| {
                FieldViolation::new("evidence", ViolationKind::InvalidValue { reason })
            };
            if span.is_empty() {
                violations.push(invalid(format!("span {}..{} is empty", span.start, span.end)));
                continue;
            }
            if !gathered
                .iter()
                .any(|read| read.start <= span.start && span.end <= read.end)
            {
                violations.push(FieldViolation::new(
                    "evidence",
                    ViolationKind::Ungrounded {
                        start: span.start,
                        end: span.end,
                    },
                ));
                continue;
            }
            match context.locate(&span.range()) {
                None => violations.push(invalid(format!(
                    "span {}..{} crosses a document boundary",
                    span.start, span.end
                ))),
                Some((doc, _)) if document.is_some_and(|d| d != doc.index) => {
                    violations.push(invalid("evidence cites more than one document".into()))
                }
                Some((doc, range)) => {
                    document = Some(doc.index);
                    local.push(EvidenceSpan::from(range));
                }
            }
        }
        draft.insert(
            "evidence",
            serde_json::to_value(&local).unwrap_or(Value::Array(Vec::new())),
        );
    }

    match context.documents().get(document.unwrap_or(0)) {
        Some(doc) => {
            let index = next_index.entry(doc.content_hash.clone()).or_insert(0);
            draft.insert("source_hash", doc.content_hash.clone());
            draft.insert("index", *index);
            draft.insert("source_url", doc.source_id.clone());
            *index += 1;
        }
        None => {
            draft.0.remove("source_hash");
            draft.0.remove("index");
        }
    }

    (draft, violations)
}
