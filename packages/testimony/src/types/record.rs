//! Structured testimony records and the drafts they are validated from.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

/// When the condition began, as a bounded category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Onset {
    /// Began in a known calendar year
    Since(u16),
    /// Has lasted a number of years
    DurationYears(u16),
    /// The narrator does not say
    Unknown,
}

fn since_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:since|from|in|began(?: in)?|started(?: in)?)?[\s\-:]*((?:19|20)\d{2})$")
            .unwrap()
    })
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:year[\s\-:]*(\d{1,2})|(\d{1,2})\+?\s*(?:years?|yrs?)(?:\s+ago)?)$")
            .unwrap()
    })
}

impl Onset {
    /// Parse free text into an onset category.
    ///
    /// Accepts the canonical forms (`since-2018`, `year-3`, `unknown`) and the
    /// phrasing narrators use ("Since 2018", "3 years", "Year 3"). Returns
    /// `None` for anything else, including blank input.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let lowered = text.to_lowercase();
        if matches!(
            lowered.as_str(),
            "unknown" | "not stated" | "unspecified" | "n/a" | "unclear"
        ) {
            return Some(Onset::Unknown);
        }

        if let Some(caps) = since_pattern().captures(text) {
            return caps[1].parse().ok().map(Onset::Since);
        }

        if let Some(caps) = duration_pattern().captures(text) {
            let years = caps.get(1).or_else(|| caps.get(2))?;
            return years.as_str().parse().ok().map(Onset::DurationYears);
        }

        None
    }

    pub fn as_label(&self) -> String {
        match self {
            Onset::Since(year) => format!("since-{year}"),
            Onset::DurationYears(years) => format!("year-{years}"),
            Onset::Unknown => "unknown".to_string(),
        }
    }
}

impl fmt::Display for Onset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_label())
    }
}

impl From<Onset> for String {
    fn from(onset: Onset) -> Self {
        onset.as_label()
    }
}

impl TryFrom<String> for Onset {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Onset::parse(&value).ok_or_else(|| format!("unrecognized onset: {value}"))
    }
}

/// A byte range of a source body that supports a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub start: usize,
    pub end: usize,
}

impl EvidenceSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl From<Range<usize>> for EvidenceSpan {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// One validated testimony case.
///
/// Identity is `(source_hash, index)`. Records carry no timestamps so that
/// re-running extraction over the same inputs produces identical files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    /// Content hash of the RawDocument this case came from
    pub source_hash: String,

    /// Position of this case within its source
    pub index: u32,

    /// Condition name or category
    pub condition: String,

    pub onset: Onset,

    /// How the condition threatens the narrator's sense of self
    pub threat_to_personhood: String,

    /// Plain summary of the experience
    pub description: String,

    /// Verbatim excerpt from the narrative
    pub narrative_fragment: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensatory_rituals: Option<String>,

    /// Where the source was fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    /// Spans of the source body that were read and support this case
    pub evidence: Vec<EvidenceSpan>,
}

impl StructuredRecord {
    pub fn identity(&self) -> (&str, u32) {
        (&self.source_hash, self.index)
    }
}

/// Unvalidated output of the reasoning capability.
///
/// Kept as a loose JSON object: the validator, not the deserializer, is the
/// single place that decides whether a draft becomes a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Draft(pub serde_json::Map<String, serde_json::Value>);

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Draft {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// What went wrong with one field of one draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    Empty,
    WrongType { expected: String },
    TooLong { max: usize, actual: usize },
    InvalidValue { reason: String },
    UnknownSource { hash: String },
    Ungrounded { start: usize, end: usize },
    Malformed { reason: String },
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Position of the offending draft within its batch, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<usize>,

    pub field: String,

    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            case: None,
            field: field.into(),
            kind,
        }
    }

    pub fn for_case(mut self, case: usize) -> Self {
        self.case = Some(case);
        self
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(case) = self.case {
            write!(f, "case {case}: ")?;
        }
        match &self.kind {
            ViolationKind::Missing => write!(f, "{} is missing", self.field),
            ViolationKind::Empty => write!(f, "{} is empty", self.field),
            ViolationKind::WrongType { expected } => {
                write!(f, "{} must be {}", self.field, expected)
            }
            ViolationKind::TooLong { max, actual } => {
                write!(f, "{} is {} chars, max {}", self.field, actual, max)
            }
            ViolationKind::InvalidValue { reason } => write!(f, "{}: {}", self.field, reason),
            ViolationKind::UnknownSource { hash } => {
                write!(f, "{} references unknown document {}", self.field, hash)
            }
            ViolationKind::Ungrounded { start, end } => write!(
                f,
                "{} cites {}..{} which was never read",
                self.field, start, end
            ),
            ViolationKind::Malformed { reason } => write!(f, "malformed reply: {reason}"),
        }
    }
}

/// Why an extraction unit produced no records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Exploration ended without reading any text
    NothingGathered,
    /// Drafts still violated the schema after the repair budget
    ValidationFailed,
    /// The reasoner declined to answer
    Refused,
    /// The reasoner kept failing transiently
    ReasonerUnavailable,
}

/// Record of an extraction unit that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Documents that made up the unit
    pub source_hashes: Vec<String>,

    pub reason: RejectionReason,

    /// Exploration rounds consumed
    pub rounds_used: usize,

    /// Drafting attempts, including the first
    pub draft_attempts: usize,

    /// Violations from the last attempt
    #[serde(default)]
    pub violations: Vec<FieldViolation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
