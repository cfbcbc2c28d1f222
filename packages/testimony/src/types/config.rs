//! Configuration types for crawling and extraction.
//!
//! Every tuning parameter is finite and validated before a run starts, so
//! that a nonsensical setting fails fast instead of stalling a worker.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Retry ceiling and backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a transient failure becomes permanent.
    ///
    /// Default: 3.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles with every attempt.
    pub base_delay: Duration,

    /// Upper bound on a single delay.
    pub max_delay: Duration,

    /// Uniform random jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// A policy with no waiting between attempts (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Whether a failure on attempt number `attempts` exhausts the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before retrying after `attempts` failed attempts (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::new(
                "base_delay",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

/// Configuration for the fetch worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Number of worker tasks.
    ///
    /// Default: 10.
    pub workers: usize,

    /// Global ceiling on requests in flight, independent of worker count.
    pub max_in_flight: usize,

    /// Global ceiling on requests per second.
    pub requests_per_second: u32,

    /// Entries claimed per ledger round-trip.
    pub claim_batch: usize,

    /// How long a claim stays exclusive before another worker may take it.
    pub lease: Duration,

    /// Upper bound on a single fetch.
    pub fetch_timeout: Duration,

    /// How often a worker extends its lease while a fetch is running.
    pub heartbeat: Duration,

    /// Idle wait when nothing is claimable but work is still outstanding.
    pub poll_interval: Duration,

    /// Links deeper than this are not enqueued.
    pub max_depth: u32,

    /// At most this many links are enqueued per fetched page.
    pub max_links_per_page: usize,

    /// Discovery stops once the ledger holds this many entries.
    pub max_documents: u64,

    /// Attempt ceiling and backoff applied when a fetch fails transiently
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_in_flight: 4,
            requests_per_second: 2,
            claim_batch: 1,
            lease: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(120),
            heartbeat: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            max_depth: 1,
            max_links_per_page: 50,
            max_documents: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn with_claim_batch(mut self, batch: usize) -> Self {
        self.claim_batch = batch;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_links_per_page(mut self, max: usize) -> Self {
        self.max_links_per_page = max;
        self
    }

    pub fn with_max_documents(mut self, max: u64) -> Self {
        self.max_documents = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::new("workers", "must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::new("max_in_flight", "must be at least 1"));
        }
        if self.requests_per_second == 0 {
            return Err(ConfigError::new(
                "requests_per_second",
                "must be at least 1",
            ));
        }
        if self.claim_batch == 0 {
            return Err(ConfigError::new("claim_batch", "must be at least 1"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::new("fetch_timeout", "must be positive"));
        }
        // The lease clock restarts when a throttle slot is granted, so time
        // spent queued behind other claims of a batch does not count here.
        if self.lease <= self.fetch_timeout {
            return Err(ConfigError::new(
                "lease",
                "must be longer than fetch_timeout",
            ));
        }
        if self.heartbeat.is_zero() || self.heartbeat >= self.lease {
            return Err(ConfigError::new(
                "heartbeat",
                "must be positive and shorter than lease",
            ));
        }
        self.retry.validate()
    }
}

/// How a context is cut into sections and how much a single read returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Sections never exceed this many bytes.
    pub max_section_chars: usize,

    /// A single read returns at most this many bytes.
    pub max_read_chars: usize,

    /// A single search returns at most this many hits.
    pub max_search_hits: usize,

    /// Bytes of surrounding text included in a search snippet, per side.
    pub snippet_radius: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_section_chars: 4_000,
            max_read_chars: 12_000,
            max_search_hits: 20,
            snippet_radius: 120,
        }
    }
}

impl ContextConfig {
    pub fn with_max_section_chars(mut self, max: usize) -> Self {
        self.max_section_chars = max;
        self
    }

    pub fn with_max_read_chars(mut self, max: usize) -> Self {
        self.max_read_chars = max;
        self
    }

    pub fn with_max_search_hits(mut self, max: usize) -> Self {
        self.max_search_hits = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_section_chars == 0 {
            return Err(ConfigError::new("max_section_chars", "must be positive"));
        }
        if self.max_read_chars == 0 {
            return Err(ConfigError::new("max_read_chars", "must be positive"));
        }
        Ok(())
    }
}

/// Maximum field lengths enforced by the validator, in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLimits {
    pub condition: usize,
    pub threat_to_personhood: usize,
    pub description: usize,
    pub narrative_fragment: usize,
    pub compensatory_rituals: usize,
    pub max_evidence_spans: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            condition: 200,
            threat_to_personhood: 2_000,
            description: 4_000,
            narrative_fragment: 4_000,
            compensatory_rituals: 2_000,
            max_evidence_spans: 32,
        }
    }
}

/// Budgets for the extraction agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Exploration queries allowed per unit.
    ///
    /// Default: 8.
    pub max_rounds: usize,

    /// Re-drafts allowed after the first draft fails validation.
    ///
    /// Default: 2.
    pub max_repair_rounds: usize,

    /// Retries of a single reasoner call on transient failure.
    pub reasoner_retry: RetryPolicy,

    /// Upper bound on a single reasoner call.
    pub reasoner_timeout: Duration,

    pub context: ContextConfig,

    pub limits: FieldLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_repair_rounds: 2,
            reasoner_retry: RetryPolicy::default(),
            reasoner_timeout: Duration::from_secs(180),
            context: ContextConfig::default(),
            limits: FieldLimits::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_max_repair_rounds(mut self, rounds: usize) -> Self {
        self.max_repair_rounds = rounds;
        self
    }

    pub fn with_reasoner_retry(mut self, retry: RetryPolicy) -> Self {
        self.reasoner_retry = retry;
        self
    }

    pub fn with_reasoner_timeout(mut self, timeout: Duration) -> Self {
        self.reasoner_timeout = timeout;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_limits(mut self, limits: FieldLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::new(
                "max_rounds",
                "an agent that may not look at its input cannot extract anything",
            ));
        }
        if self.reasoner_timeout.is_zero() {
            return Err(ConfigError::new("reasoner_timeout", "must be positive"));
        }
        self.reasoner_retry.validate()?;
        self.context.validate()
    }
}

/// Configuration for the extraction stage driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Units processed at once.
    pub concurrency: usize,

    /// RawDocuments materialized into one unit.
    pub documents_per_unit: usize,

    /// Re-extract sources that already have records.
    pub reextract: bool,

    pub agent: AgentConfig,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            documents_per_unit: 1,
            reextract: false,
            agent: AgentConfig::default(),
        }
    }
}

impl ExtractConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_documents_per_unit(mut self, documents: usize) -> Self {
        self.documents_per_unit = documents;
        self
    }

    pub fn with_reextract(mut self, reextract: bool) -> Self {
        self.reextract = reextract;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::new("concurrency", "must be at least 1"));
        }
        if self.documents_per_unit == 0 {
            return Err(ConfigError::new(
                "documents_per_unit",
                "must be at least 1",
            ));
        }
        self.agent.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(Duration::ZERO);

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_exhausted_at_ceiling() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn test_zero_round_budget_is_rejected() {
        let err = AgentConfig::new().with_max_rounds(0).validate().unwrap_err();
        assert_eq!(err.field, "max_rounds");
    }

    #[test]
    fn test_lease_must_outlive_fetch() {
        let config = FetchConfig::new()
            .with_fetch_timeout(Duration::from_secs(10))
            .with_lease(Duration::from_secs(10));
        assert!(config.validate().is_err());
        assert!(FetchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_fit_in_lease() {
        let config = FetchConfig::new()
            .with_fetch_timeout(Duration::from_millis(100))
            .with_lease(Duration::from_millis(120));
        assert_eq!(
            config.clone().with_heartbeat(Duration::from_millis(120)).validate().unwrap_err().field,
            "heartbeat"
        );
        assert_eq!(
            config.clone().with_heartbeat(Duration::ZERO).validate().unwrap_err().field,
            "heartbeat"
        );
        assert!(config.with_heartbeat(Duration::from_millis(30)).validate().is_ok());
    }
}
