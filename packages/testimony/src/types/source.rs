//! Seed registry - the forums a crawl starts from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::ConfigError;

/// One seed URL plus the link rules that apply to pages discovered from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSeed {
    pub name: String,
    pub url: String,

    /// Overrides the pool-wide links-per-page cap for this source
    #[serde(default)]
    pub max_links: Option<usize>,

    /// When non-empty, a discovered link must contain one of these tokens
    #[serde(default)]
    pub require_tokens: Vec<String>,

    /// Links containing any of these tokens are never enqueued
    #[serde(default)]
    pub deny_tokens: Vec<String>,

    /// Links scoring below this are dropped
    #[serde(default)]
    pub min_score: Option<i64>,
}

impl SourceSeed {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            max_links: None,
            require_tokens: Vec::new(),
            deny_tokens: Vec::new(),
            min_score: None,
        }
    }

    pub fn with_require_tokens(mut self, tokens: &[&str]) -> Self {
        self.require_tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_deny_tokens(mut self, tokens: &[&str]) -> Self {
        self.deny_tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_min_score(mut self, score: i64) -> Self {
        self.min_score = Some(score);
        self
    }

    pub fn with_max_links(mut self, max: usize) -> Self {
        self.max_links = Some(max);
        self
    }
}

/// Named seeds, looked up by the `source_name` recorded on ledger entries.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    seeds: Vec<SourceSeed>,
    by_name: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new(seeds: Vec<SourceSeed>) -> Self {
        let mut registry = Self::default();
        for seed in seeds {
            registry.insert(seed);
        }
        registry
    }

    /// Parse a JSON array of seeds. Seeds whose URL does not parse are skipped.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let seeds: Vec<SourceSeed> = serde_json::from_str(json)
            .map_err(|e| ConfigError::new("sources", e.to_string()))?;

        let mut registry = Self::default();
        for seed in seeds {
            if url::Url::parse(&seed.url).is_err() {
                warn!(source = %seed.name, url = %seed.url, "Skipping seed with invalid URL");
                continue;
            }
            registry.insert(seed);
        }
        Ok(registry)
    }

    fn insert(&mut self, seed: SourceSeed) {
        match self.by_name.get(&seed.name) {
            Some(&idx) => self.seeds[idx] = seed,
            None => {
                self.by_name.insert(seed.name.clone(), self.seeds.len());
                self.seeds.push(seed);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&SourceSeed> {
        self.by_name.get(name).map(|&idx| &self.seeds[idx])
    }

    pub fn seeds(&self) -> &[SourceSeed] {
        &self.seeds
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_skips_invalid_urls() {
        let json = r#"[
            {"name": "Phoenix Rising", "url": "https://forums.phoenixrising.me/forums/the-patients-story.4/"},
            {"name": "Broken", "url": "not a url"},
            {"name": "Healthtalk", "url": "https://healthtalk.org/long-covid", "require_tokens": ["long-covid"]}
        ]"#;

        let registry = SourceRegistry::from_json(json).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("Broken").is_none());
        assert_eq!(
            registry.get("Healthtalk").unwrap().require_tokens,
            vec!["long-covid".to_string()]
        );
    }

    #[test]
    fn test_from_json_rejects_non_array() {
        assert!(SourceRegistry::from_json("{}").is_err());
    }

    #[test]
    fn test_duplicate_names_keep_last() {
        let registry = SourceRegistry::new(vec![
            SourceSeed::new("a", "https://a.example/1"),
            SourceSeed::new("a", "https://a.example/2"),
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().url, "https://a.example/2");
    }
}
