//! Raw document types - fetched bodies and their provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A page as returned by a crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    /// URL that was fetched
    pub url: String,

    /// Page body (markdown)
    pub body: String,

    /// Page title if available
    pub title: Option<String>,

    /// Outbound links found on the page
    #[serde(default)]
    pub links: Vec<String>,
}

impl FetchedPage {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
            title: None,
            links: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }
}

/// An immutable fetched body, keyed by the hash of its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    /// Hex SHA-256 of the canonicalized body
    pub content_hash: String,

    /// First source the body was recorded under
    pub source_id: String,

    /// When that first source was recorded
    pub fetched_at: DateTime<Utc>,

    /// Canonicalized body
    pub body: String,
}

/// Link from a content hash to one source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceLink {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// Canonical form of a fetched body.
///
/// Line endings become `\n`, trailing whitespace is stripped from every
/// line and leading/trailing blank lines are dropped. Two fetches that only
/// differ in these respects hash identically.
pub fn canonicalize_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.lines().map(str::trim_end).collect();

    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());

    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Calculate SHA-256 hash of content.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonicalize_normalizes_line_endings_and_whitespace() {
        let body = "\r\n\r\n# Title  \r\nLine one\t\r\n\r\nLine two\r\n\r\n";
        assert_eq!(canonicalize_body(body), "# Title\nLine one\n\nLine two");
    }

    #[test]
    fn test_equivalent_bodies_hash_identically() {
        let a = canonicalize_body("hello\nworld\n");
        let b = canonicalize_body("hello  \r\nworld");
        assert_eq!(hash_content(&a), hash_content(&b));
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_content("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_blank_body_canonicalizes_to_empty() {
        assert_eq!(canonicalize_body(" \n\t\n  "), "");
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(body in "[ a-z\\r\\n\\t#]{0,200}") {
            let once = canonicalize_body(&body);
            prop_assert_eq!(canonicalize_body(&once), once);
        }
    }
}
