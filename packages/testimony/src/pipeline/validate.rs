//! Schema validator - the single gate between drafts and records.
//!
//! Validation is pure. It repairs what can be repaired without guessing
//! (surrounding whitespace, narrator phrasing of the onset) and reports
//! everything else as a list of violations, all at once, so that a repair
//! round can address them together.

use serde_json::Value;
use std::collections::HashMap;

use crate::types::{
    config::FieldLimits,
    record::{Draft, EvidenceSpan, FieldViolation, Onset, StructuredRecord, ViolationKind},
};

/// What a draft is validated against.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Body length of every RawDocument a draft may reference, by hash
    known_sources: HashMap<String, usize>,
    limits: FieldLimits,
}

impl ValidationContext {
    pub fn new(limits: FieldLimits) -> Self {
        Self {
            known_sources: HashMap::new(),
            limits,
        }
    }

    /// Allow drafts to reference `content_hash`, whose body is `body_len` bytes.
    pub fn with_source(mut self, content_hash: impl Into<String>, body_len: usize) -> Self {
        self.known_sources.insert(content_hash.into(), body_len);
        self
    }

    pub fn limits(&self) -> &FieldLimits {
        &self.limits
    }
}

struct Checker<'a> {
    draft: &'a Draft,
    violations: Vec<FieldViolation>,
}

impl<'a> Checker<'a> {
    fn violation(&mut self, field: &str, kind: ViolationKind) {
        self.violations.push(FieldViolation::new(field, kind));
    }

    fn present(&mut self, field: &str) -> Option<&'a Value> {
        match self.draft.get(field) {
            None | Some(Value::Null) => {
                self.violation(field, ViolationKind::Missing);
                None
            }
            Some(value) => Some(value),
        }
    }

    fn string(&mut self, field: &str, value: &'a Value, max: usize) -> Option<String> {
        let Some(text) = value.as_str() else {
            self.violation(
                field,
                ViolationKind::WrongType {
                    expected: "string".into(),
                },
            );
            return None;
        };
        let text = text.trim();
        if text.is_empty() {
            self.violation(field, ViolationKind::Empty);
            return None;
        }
        let actual = text.chars().count();
        if actual > max {
            self.violation(field, ViolationKind::TooLong { max, actual });
            return None;
        }
        Some(text.to_string())
    }

    fn required_string(&mut self, field: &str, max: usize) -> Option<String> {
        let value = self.present(field)?;
        self.string(field, value, max)
    }

    /// Absent, null and blank all mean "not given".
    fn optional_string(&mut self, field: &str, max: usize) -> Option<String> {
        match self.draft.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(value) => self.string(field, value, max),
        }
    }

    fn onset(&mut self) -> Option<Onset> {
        let value = self.present("onset")?;
        let text = match value {
            Value::String(s) => s.clone(),
            // A bare year is how narrators most often give it
            Value::Number(n) => n.to_string(),
            _ => {
                self.violation(
                    "onset",
                    ViolationKind::WrongType {
                        expected: "string".into(),
                    },
                );
                return None;
            }
        };
        if text.trim().is_empty() {
            self.violation("onset", ViolationKind::Empty);
            return None;
        }
        let onset = Onset::parse(&text);
        if onset.is_none() {
            self.violation(
                "onset",
                ViolationKind::InvalidValue {
                    reason: format!(
                        "{text:?} is not one of since-YYYY, year-N or unknown"
                    ),
                },
            );
        }
        onset
    }

    fn index(&mut self) -> Option<u32> {
        let value = self.present("index")?;
        let index = value.as_u64().and_then(|n| u32::try_from(n).ok());
        if index.is_none() {
            self.violation(
                "index",
                ViolationKind::WrongType {
                    expected: "non-negative integer".into(),
                },
            );
        }
        index
    }

    fn source_hash(&mut self, ctx: &ValidationContext) -> Option<(String, usize)> {
        let value = self.present("source_hash")?;
        let Some(hash) = value.as_str() else {
            self.violation(
                "source_hash",
                ViolationKind::WrongType {
                    expected: "string".into(),
                },
            );
            return None;
        };
        match ctx.known_sources.get(hash) {
            Some(len) => Some((hash.to_string(), *len)),
            None => {
                self.violation(
                    "source_hash",
                    ViolationKind::UnknownSource {
                        hash: hash.to_string(),
                    },
                );
                None
            }
        }
    }

    fn evidence(&mut self, body_len: Option<usize>, max_spans: usize) -> Option<Vec<EvidenceSpan>> {
        let value = self.present("evidence")?;
        let wrong_type = || ViolationKind::WrongType {
            expected: "array of {start, end}".into(),
        };

        let Some(items) = value.as_array() else {
            self.violation("evidence", wrong_type());
            return None;
        };
        if items.is_empty() {
            self.violation("evidence", ViolationKind::Empty);
            return None;
        }
        if items.len() > max_spans {
            self.violation(
                "evidence",
                ViolationKind::TooLong {
                    max: max_spans,
                    actual: items.len(),
                },
            );
            return None;
        }

        let mut spans = Vec::with_capacity(items.len());
        let mut ok = true;
        for item in items {
            let Ok(span) = serde_json::from_value::<EvidenceSpan>(item.clone()) else {
                self.violation("evidence", wrong_type());
                ok = false;
                continue;
            };
            if span.is_empty() {
                self.violation(
                    "evidence",
                    ViolationKind::InvalidValue {
                        reason: format!("span {}..{} is empty", span.start, span.end),
                    },
                );
                ok = false;
            } else if body_len.is_some_and(|len| span.end > len) {
                self.violation(
                    "evidence",
                    ViolationKind::InvalidValue {
                        reason: format!(
                            "span {}..{} runs past the end of the source",
                            span.start, span.end
                        ),
                    },
                );
                ok = false;
            } else {
                spans.push(span);
            }
        }
        ok.then_some(spans)
    }
}

/// Validate one draft into a record.
///
/// Unknown fields are dropped. Every violation found is returned, not just
/// the first.
pub fn validate_draft(
    draft: &Draft,
    ctx: &ValidationContext,
) -> Result<StructuredRecord, Vec<FieldViolation>> {
    let limits = &ctx.limits;
    let mut check = Checker {
        draft,
        violations: Vec::new(),
    };

    let source = check.source_hash(ctx);
    let index = check.index();
    let condition = check.required_string("condition", limits.condition);
    let onset = check.onset();
    let threat = check.required_string("threat_to_personhood", limits.threat_to_personhood);
    let description = check.required_string("description", limits.description);
    let fragment = check.required_string("narrative_fragment", limits.narrative_fragment);
    let rituals = check.optional_string("compensatory_rituals", limits.compensatory_rituals);
    let source_url = check.optional_string("source_url", usize::MAX);
    let evidence = check.evidence(
        source.as_ref().map(|(_, len)| *len),
        limits.max_evidence_spans,
    );

    match (
        source,
        index,
        condition,
        onset,
        threat,
        description,
        fragment,
        evidence,
    ) {
        (
            Some((source_hash, _)),
            Some(index),
            Some(condition),
            Some(onset),
            Some(threat_to_personhood),
            Some(description),
            Some(narrative_fragment),
            Some(evidence),
        ) if check.violations.is_empty() => Ok(StructuredRecord {
            source_hash,
            index,
            condition,
            onset,
            threat_to_personhood,
            description,
            narrative_fragment,
            compensatory_rituals: rituals,
            source_url,
            evidence,
        }),
        _ => Err(check.violations),
    }
}

/// Re-check a record that was read back from storage.
///
/// A record passes if it would validate into itself. The source hash is
/// taken as known; the caller checks it against the file it came from.
pub fn validate_record(record: &StructuredRecord, limits: &FieldLimits) -> Vec<FieldViolation> {
    let draft = match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Draft(map),
        Ok(_) | Err(_) => {
            return vec![FieldViolation::new(
                "record",
                ViolationKind::Malformed {
                    reason: "record does not serialize to an object".into(),
                },
            )]
        }
    };
    let ctx = ValidationContext::new(limits.clone()).with_source(&record.source_hash, usize::MAX);

    match validate_draft(&draft, &ctx) {
        Ok(validated) if validated == *record => Vec::new(),
        Ok(_) => vec![FieldViolation::new(
            "record",
            ViolationKind::InvalidValue {
                reason: "fields are not in normalized form".into(),
            },
        )],
        Err(violations) => violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const HASH: &str = "5f0c4d4b0a4f6f3e2c8e7d1a9b3c5e7f9a1b3c5d7e9f1a3b5c7d9e1f3a5b7c9d";

    fn ctx() -> ValidationContext {
        ValidationContext::new(FieldLimits::default()).with_source(HASH, 500)
    }

    fn complete_draft() -> Draft {
        Draft::new()
            .with("source_hash", HASH)
            .with("index", 0)
            .with("condition", "  Long COVID ")
            .with("onset", "Since 2020")
            .with("threat_to_personhood", "I lost my career as a nurse.")
            .with("description", "Fatigue and brain fog for years.")
            .with("narrative_fragment", "I used to run marathons.")
            .with("evidence", json!([{"start": 10, "end": 80}]))
    }

    fn fields(violations: &[FieldViolation]) -> Vec<&str> {
        violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn test_valid_draft_is_repaired_into_record() {
        let record = validate_draft(&complete_draft().with("mood", "sad"), &ctx()).unwrap();

        assert_eq!(record.condition, "Long COVID");
        assert_eq!(record.onset, Onset::Since(2020));
        assert_eq!(record.evidence, vec![EvidenceSpan::new(10, 80)]);
        assert!(record.compensatory_rituals.is_none());
    }

    #[test]
    fn test_numeric_onset_is_a_year() {
        let record = validate_draft(&complete_draft().with("onset", 2016), &ctx()).unwrap();
        assert_eq!(record.onset, Onset::Since(2016));
    }

    #[test]
    fn test_reports_every_violation() {
        let mut draft = complete_draft();
        draft.0.remove("condition");
        let draft = draft
            .with("onset", "after the wedding")
            .with("description", 42)
            .with("narrative_fragment", "   ");

        let violations = validate_draft(&draft, &ctx()).unwrap_err();
        assert_eq!(
            fields(&violations),
            vec!["condition", "onset", "description", "narrative_fragment"]
        );
        assert_eq!(violations[0].kind, ViolationKind::Missing);
        assert_eq!(violations[3].kind, ViolationKind::Empty);
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let draft = complete_draft().with("source_hash", "deadbeef");
        let violations = validate_draft(&draft, &ctx()).unwrap_err();
        assert!(matches!(
            violations[0].kind,
            ViolationKind::UnknownSource { .. }
        ));
    }

    #[test]
    fn test_evidence_must_be_nonempty_and_in_bounds() {
        let empty = complete_draft().with("evidence", json!([]));
        assert_eq!(
            validate_draft(&empty, &ctx()).unwrap_err()[0].kind,
            ViolationKind::Empty
        );

        let past_end = complete_draft().with("evidence", json!([{"start": 400, "end": 600}]));
        assert!(matches!(
            validate_draft(&past_end, &ctx()).unwrap_err()[0].kind,
            ViolationKind::InvalidValue { .. }
        ));

        let inverted = complete_draft().with("evidence", json!([{"start": 9, "end": 3}]));
        assert!(validate_draft(&inverted, &ctx()).is_err());
    }

    #[test]
    fn test_field_limits() {
        let limits = FieldLimits {
            condition: 5,
            ..FieldLimits::default()
        };
        let ctx = ValidationContext::new(limits).with_source(HASH, 500);
        let violations = validate_draft(&complete_draft(), &ctx).unwrap_err();
        assert_eq!(
            violations[0].kind,
            ViolationKind::TooLong { max: 5, actual: 10 }
        );
    }

    #[test]
    fn test_index_must_be_non_negative_integer() {
        let draft = complete_draft().with("index", -1);
        let violations = validate_draft(&draft, &ctx()).unwrap_err();
        assert_eq!(fields(&violations), vec!["index"]);
    }

    #[test]
    fn test_blank_optional_field_is_absent() {
        let draft = complete_draft().with("compensatory_rituals", "  ");
        let record = validate_draft(&draft, &ctx()).unwrap();
        assert!(record.compensatory_rituals.is_none());
    }

    #[test]
    fn test_validated_record_revalidates_clean() {
        let record = validate_draft(&complete_draft(), &ctx()).unwrap();
        assert!(validate_record(&record, &FieldLimits::default()).is_empty());

        let mut stale = record.clone();
        stale.condition = " padded ".into();
        assert!(!validate_record(&stale, &FieldLimits::default()).is_empty());
    }

    proptest! {
        #[test]
        fn validation_is_closed(
            condition in "[ a-zA-Z/]{0,40}",
            onset in prop_oneof![
                Just("unknown".to_string()),
                Just("since 2019".to_string()),
                Just("3 years".to_string()),
                "[a-z ]{0,12}",
            ],
            description in "[ a-z.]{0,60}",
            start in 0usize..400,
            len in 0usize..150,
        ) {
            let draft = complete_draft()
                .with("condition", condition)
                .with("onset", onset)
                .with("description", description)
                .with("evidence", json!([{"start": start, "end": start + len}]));

            if let Ok(record) = validate_draft(&draft, &ctx()) {
                prop_assert!(validate_record(&record, &FieldLimits::default()).is_empty());

                let map = match serde_json::to_value(&record).unwrap() {
                    Value::Object(map) => map,
                    other => panic!("not an object: {other}"),
                };
                prop_assert_eq!(validate_draft(&Draft(map), &ctx()).unwrap(), record);
            }
        }
    }
}
