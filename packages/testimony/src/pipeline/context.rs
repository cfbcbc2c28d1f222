//! Context materializer - an explorable view over one or more raw documents.
//!
//! Documents are concatenated (separated by a blank line) and cut into
//! sections at markdown headings, horizontal rules and paragraph breaks.
//! Every offset handed out is a byte offset into the concatenated text and
//! always lands on a `char` boundary. The context is read-only: building
//! it, reading it and searching it have no side effects.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::types::{config::ContextConfig, document::RawDocument};

const DOCUMENT_SEPARATOR: &str = "\n\n";
const MAX_SCANNED_MATCHES: usize = 2_000;

/// A document's place inside the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub index: usize,
    pub content_hash: String,
    pub source_id: String,
    pub range: Range<usize>,
}

/// Descriptor of one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub index: usize,
    /// Index of the owning document
    pub document: usize,
    /// Nearest markdown heading at or above the section
    pub heading: Option<String>,
    pub range: Range<usize>,
    pub len: usize,
}

/// Structure of the whole context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overview {
    pub total_len: usize,
    pub documents: Vec<DocumentInfo>,
    pub sections: Vec<SectionInfo>,
}

/// Literal text of a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub range: Range<usize>,
    pub text: String,
}

/// One search match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched text's range
    pub range: Range<usize>,
    /// Section containing the match, if any
    pub section: Option<usize>,
    /// Range of the snippet shown for this hit
    pub snippet_range: Range<usize>,
    pub snippet: String,
}

/// The explorable form of an extraction unit.
#[derive(Debug, Clone)]
pub struct MaterializedContext {
    text: String,
    documents: Vec<DocumentInfo>,
    sections: Vec<SectionInfo>,
    config: ContextConfig,
}

impl MaterializedContext {
    /// Materialize a context over the given documents, in order.
    pub fn new(documents: &[RawDocument], config: ContextConfig) -> Self {
        let mut text = String::new();
        let mut infos = Vec::with_capacity(documents.len());
        let mut sections = Vec::new();

        for (index, doc) in documents.iter().enumerate() {
            if index > 0 {
                text.push_str(DOCUMENT_SEPARATOR);
            }
            let base = text.len();
            text.push_str(&doc.body);

            infos.push(DocumentInfo {
                index,
                content_hash: doc.content_hash.clone(),
                source_id: doc.source_id.clone(),
                range: base..text.len(),
            });
            split_sections(
                &doc.body,
                base,
                index,
                config.max_section_chars.max(1),
                &mut sections,
            );
        }

        Self {
            text,
            documents: infos,
            sections,
            config,
        }
    }

    /// Total length of the context in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn documents(&self) -> &[DocumentInfo] {
        &self.documents
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    /// Document and section structure.
    pub fn overview(&self) -> Overview {
        Overview {
            total_len: self.text.len(),
            documents: self.documents.clone(),
            sections: self.sections.clone(),
        }
    }

    /// Literal text of a range.
    ///
    /// The range is clamped to the context, shortened to the configured
    /// read limit and snapped back to `char` boundaries. An inverted range
    /// reads nothing.
    pub fn read(&self, range: Range<usize>) -> Span {
        let len = self.text.len();
        let start = floor_boundary(&self.text, range.start.min(len));
        let end = range
            .end
            .min(len)
            .min(start.saturating_add(self.config.max_read_chars))
            .max(start);
        let end = floor_boundary(&self.text, end);

        Span {
            range: start..end,
            text: self.text[start..end].to_string(),
        }
    }

    /// Literal text of a range already handed out, without the read limit.
    pub(crate) fn excerpt(&self, range: Range<usize>) -> Span {
        let start = floor_boundary(&self.text, range.start);
        let end = floor_boundary(&self.text, range.end).max(start);
        Span {
            range: start..end,
            text: self.text[start..end].to_string(),
        }
    }

    /// Read a whole section (subject to the read limit).
    pub fn read_section(&self, index: usize) -> Option<Span> {
        self.sections
            .get(index)
            .map(|section| self.read(section.range.clone()))
    }

    /// Case-insensitive search.
    ///
    /// `pattern` is tried as a regular expression first and as literal text
    /// if it does not compile. Hits are ranked by how densely the pattern
    /// occurs in their section, then by position.
    pub fn search(&self, pattern: &str) -> Vec<SearchHit> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Vec::new();
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(pattern))
                    .case_insensitive(true)
                    .build()
            });
        let Ok(regex) = regex else {
            return Vec::new();
        };

        let matches: Vec<Range<usize>> = regex
            .find_iter(&self.text)
            .filter(|m| m.start() < m.end())
            .take(MAX_SCANNED_MATCHES)
            .map(|m| m.range())
            .collect();

        let mut per_section = vec![0usize; self.sections.len()];
        let located: Vec<(Range<usize>, Option<usize>)> = matches
            .into_iter()
            .map(|range| {
                let section = self.section_at(range.start);
                if let Some(idx) = section {
                    per_section[idx] += 1;
                }
                (range, section)
            })
            .collect();

        let density = |section: Option<usize>| -> f64 {
            match section {
                Some(idx) => per_section[idx] as f64 / self.sections[idx].len.max(1) as f64,
                None => 0.0,
            }
        };

        let mut hits: Vec<(f64, SearchHit)> = located
            .into_iter()
            .map(|(range, section)| {
                let snippet_range = self.snippet_range(&range);
                let hit = SearchHit {
                    snippet: self.text[snippet_range.clone()].to_string(),
                    range,
                    section,
                    snippet_range,
                };
                (density(section), hit)
            })
            .collect();

        hits.sort_by(|(da, a), (db, b)| {
            db.total_cmp(da)
                .then_with(|| a.range.start.cmp(&b.range.start))
        });
        hits.truncate(self.config.max_search_hits);
        hits.into_iter().map(|(_, hit)| hit).collect()
    }

    /// Map a context range back to a document and a range within its body.
    ///
    /// Returns `None` if the range is empty or crosses a document boundary.
    pub fn locate(&self, range: &Range<usize>) -> Option<(&DocumentInfo, Range<usize>)> {
        if range.start >= range.end {
            return None;
        }
        self.documents
            .iter()
            .find(|doc| doc.range.start <= range.start && range.end <= doc.range.end)
            .map(|doc| (doc, range.start - doc.range.start..range.end - doc.range.start))
    }

    fn section_at(&self, pos: usize) -> Option<usize> {
        let idx = self.sections.partition_point(|s| s.range.end <= pos);
        self.sections
            .get(idx)
            .filter(|s| s.range.start <= pos)
            .map(|s| s.index)
    }

    fn snippet_range(&self, range: &Range<usize>) -> Range<usize> {
        let radius = self.config.snippet_radius;
        let start = floor_boundary(&self.text, range.start.saturating_sub(radius));
        let end = ceil_boundary(&self.text, range.end.saturating_add(radius));
        start..end
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn is_rule(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && (compact.chars().all(|c| c == '-')
            || compact.chars().all(|c| c == '*')
            || compact.chars().all(|c| c == '_'))
}

fn heading_text(line: &str) -> Option<String> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim().trim_end_matches('#').trim().to_string())
}

enum Block {
    Text {
        range: Range<usize>,
        heading: Option<String>,
    },
    Rule,
}

/// Cut a document body into blocks: runs of non-blank lines, with headings
/// always opening a new block.
fn blocks(body: &str) -> Vec<Block> {
    let mut out = Vec::new();
    let mut current: Option<(usize, usize, Option<String>)> = None;
    let mut offset = 0;

    for line in body.split('\n') {
        let start = offset;
        let end = start + line.len();
        offset = end + 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some((s, e, h)) = current.take() {
                out.push(Block::Text { range: s..e, heading: h });
            }
            continue;
        }
        if is_rule(trimmed) {
            if let Some((s, e, h)) = current.take() {
                out.push(Block::Text { range: s..e, heading: h });
            }
            out.push(Block::Rule);
            continue;
        }
        if let Some(heading) = heading_text(trimmed) {
            if let Some((s, e, h)) = current.take() {
                out.push(Block::Text { range: s..e, heading: h });
            }
            current = Some((start, end, Some(heading)));
            continue;
        }
        match current.as_mut() {
            Some((_, e, _)) => *e = end,
            None => current = Some((start, end, None)),
        }
    }
    if let Some((s, e, h)) = current {
        out.push(Block::Text { range: s..e, heading: h });
    }
    out
}

/// Split an oversized block into pieces of at most `max` bytes, preferring
/// to cut at a line break or a space in the back half of each piece.
fn hard_split(body: &str, range: Range<usize>, max: usize) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut start = range.start;

    while start < range.end {
        let mut cut = floor_boundary(body, (start + max).min(range.end));
        if cut < range.end {
            let window = &body[start..cut];
            let floor = max / 2;
            if let Some(pos) = window.rfind('\n').or_else(|| window.rfind(' ')) {
                if pos > floor {
                    cut = start + pos + 1;
                }
            }
        }
        if cut <= start {
            cut = ceil_boundary(body, start + 1);
        }
        pieces.push(start..cut);
        start = cut;
    }
    pieces
}

fn split_sections(
    body: &str,
    base: usize,
    document: usize,
    max: usize,
    out: &mut Vec<SectionInfo>,
) {
    let mut heading: Option<String> = None;
    let mut current: Option<Range<usize>> = None;

    let push = |range: Range<usize>, heading: &Option<String>, out: &mut Vec<SectionInfo>| {
        out.push(SectionInfo {
            index: out.len(),
            document,
            heading: heading.clone(),
            len: range.len(),
            range: base + range.start..base + range.end,
        });
    };

    for block in blocks(body) {
        let (range, block_heading) = match block {
            Block::Rule => {
                if let Some(range) = current.take() {
                    push(range, &heading, out);
                }
                continue;
            }
            Block::Text { range, heading } => (range, heading),
        };

        if block_heading.is_some() {
            if let Some(range) = current.take() {
                push(range, &heading, out);
            }
            heading = block_heading;
        }

        if range.len() > max {
            if let Some(range) = current.take() {
                push(range, &heading, out);
            }
            for piece in hard_split(body, range, max) {
                push(piece, &heading, out);
            }
            continue;
        }

        current = match current.take() {
            Some(cur) if range.end - cur.start > max => {
                push(cur, &heading, out);
                Some(range)
            }
            Some(cur) => Some(cur.start..range.end),
            None => Some(range),
        };
    }

    if let Some(range) = current {
        push(range, &heading, out);
    }
}
