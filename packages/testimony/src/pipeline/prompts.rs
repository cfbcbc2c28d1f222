//! Prompt rendering and reply parsing for language-model reasoners.
//!
//! Reasoners that talk to a chat model use these to turn agent requests
//! into prompts and model replies back into typed actions and drafts.

use std::fmt::Write;

use crate::error::{ReasonError, ReasonResult};
use crate::pipeline::context::Span;
use crate::traits::reasoner::{Action, DraftRequest, ExploreRequest, Observation};
use crate::types::record::Draft;

/// Observations older than the most recent few are shown as one-liners.
const FULL_OBSERVATIONS: usize = 3;

pub const EXPLORE_SYSTEM: &str = r#"You are reading patient-forum posts to find first-person testimony about chronic illness.
You cannot see the text directly. Each turn, choose exactly one action and reply with a single JSON object:
{"action": "overview"}                        - list documents and sections with their byte ranges
{"action": "read", "start": N, "end": M}      - read the literal text of a byte range
{"action": "search", "pattern": "..."}        - case-insensitive search (regex or plain text)
{"action": "finish"}                          - you have read enough to describe every case
Read the passages you will cite. Finish early when the text holds no testimony."#;

pub const DRAFT_SYSTEM: &str = r#"You turn patient-forum testimony into structured cases.
Reply with a single JSON object: {"cases": [...]}. Each case has:
  condition             - the condition as the narrator names it
  onset                 - "since-YYYY", "year-N" (years lived with it) or "unknown"
  threat_to_personhood  - how the condition threatens who the narrator is
  description           - a plain summary of the experience
  narrative_fragment    - a short verbatim excerpt
  compensatory_rituals  - optional: what the narrator does to cope
  evidence              - [{"start": N, "end": M}, ...] byte ranges taken from the passages below
Cite only ranges inside the passages shown. Return {"cases": []} if there is no testimony."#;

fn render_observation(out: &mut String, observation: &Observation, full: bool) {
    match observation {
        Observation::Overview(overview) => {
            let _ = writeln!(
                out,
                "overview: {} bytes, {} documents, {} sections",
                overview.total_len,
                overview.documents.len(),
                overview.sections.len()
            );
            if !full {
                return;
            }
            for doc in &overview.documents {
                let _ = writeln!(
                    out,
                    "  document {} [{}..{}] {}",
                    doc.index, doc.range.start, doc.range.end, doc.source_id
                );
            }
            for section in &overview.sections {
                let _ = writeln!(
                    out,
                    "  section {} (document {}) [{}..{}] {}",
                    section.index,
                    section.document,
                    section.range.start,
                    section.range.end,
                    section.heading.as_deref().unwrap_or("-")
                );
            }
        }
        Observation::Read(span) => {
            let _ = writeln!(out, "read [{}..{}]", span.range.start, span.range.end);
            if full {
                let _ = writeln!(out, "{}", span.text);
            }
        }
        Observation::Search { pattern, hits } => {
            let _ = writeln!(out, "search {pattern:?}: {} hits", hits.len());
            if !full {
                return;
            }
            for hit in hits {
                let _ = writeln!(
                    out,
                    "  [{}..{}] section {}: {}",
                    hit.snippet_range.start,
                    hit.snippet_range.end,
                    hit.section.map_or_else(|| "-".to_string(), |s| s.to_string()),
                    hit.snippet.replace('\n', " ")
                );
            }
        }
        Observation::Invalid { reason } => {
            let _ = writeln!(out, "your last reply was not a valid action: {reason}");
        }
    }
}

/// User prompt for one exploration step.
pub fn explore_prompt(request: &ExploreRequest<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Round {} of {} ({} left).",
        request.round + 1,
        request.max_rounds,
        request.rounds_left()
    );
    let _ = writeln!(out, "Documents:");
    for doc in request.documents {
        let _ = writeln!(
            out,
            "  {} [{}..{}] {}",
            doc.index, doc.range.start, doc.range.end, doc.source_id
        );
    }

    if request.observations.is_empty() {
        out.push_str("\nNothing observed yet.\n");
    } else {
        out.push_str("\nObserved so far:\n");
        let recent = request.observations.len().saturating_sub(FULL_OBSERVATIONS);
        for (i, observation) in request.observations.iter().enumerate() {
            render_observation(&mut out, observation, i >= recent);
        }
    }
    out.push_str("\nReply with the next action.");
    out
}

fn render_spans(out: &mut String, spans: &[Span]) {
    for span in spans {
        let _ = writeln!(out, "--- [{}..{}]", span.range.start, span.range.end);
        let _ = writeln!(out, "{}", span.text);
    }
}

/// User prompt for one drafting attempt.
pub fn draft_prompt(request: &DraftRequest<'_>) -> String {
    let mut out = String::from("Passages read (byte ranges are the ones to cite):\n");
    render_spans(&mut out, request.spans);

    if request.is_repair() {
        out.push_str("\nYour previous cases were rejected:\n");
        for violation in request.violations {
            let _ = writeln!(out, "- {violation}");
        }
        out.push_str("Return the complete corrected list of cases.");
    } else {
        out.push_str("\nReturn the cases.");
    }
    out
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json)
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

pub fn parse_action(reply: &str) -> ReasonResult<Action> {
    serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| ReasonError::Malformed(format!("invalid action: {e}")))
}

/// Accepts `{"cases": [...]}` or a bare array of case objects.
pub fn parse_drafts(reply: &str) -> ReasonResult<Vec<Draft>> {
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| ReasonError::Malformed(format!("invalid JSON: {e}")))?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("cases") {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                return Err(ReasonError::Malformed(
                    "expected a \"cases\" array".to_string(),
                ))
            }
        },
        _ => {
            return Err(ReasonError::Malformed(
                "expected an object with \"cases\"".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            serde_json::Value::Object(map) => Ok(Draft(map)),
            _ => Err(ReasonError::Malformed(format!("case {i} is not an object"))),
        })
        .collect()
}
