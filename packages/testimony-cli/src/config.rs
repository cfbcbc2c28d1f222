//! Command-line tuning flags and their mapping onto library configuration.
//!
//! Every flag can also be set through a `TESTIMONY_*` environment variable
//! (or a `.env` file).

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use testimony::{AgentConfig, ExtractConfig, FetchConfig, RetryPolicy};

#[derive(Args, Debug)]
pub struct CrawlArgs {
    /// JSON array of `{name, url, max_links?}` seeds
    #[arg(long, env = "TESTIMONY_SOURCES", default_value = "sources.json")]
    pub sources: PathBuf,

    /// Concurrent fetch workers
    #[arg(long, env = "TESTIMONY_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Fetches in flight at once across all workers
    #[arg(long, env = "TESTIMONY_MAX_IN_FLIGHT", default_value_t = 4)]
    pub max_in_flight: usize,

    /// Fetches started per second across all workers
    #[arg(long, env = "TESTIMONY_RPS", default_value_t = 2)]
    pub rps: u32,

    /// Link hops followed from each seed
    #[arg(long, env = "TESTIMONY_MAX_DEPTH", default_value_t = 1)]
    pub max_depth: u32,

    /// Links enqueued per page, unless the seed sets its own
    #[arg(long, env = "TESTIMONY_MAX_LINKS", default_value_t = 50)]
    pub max_links: usize,

    /// Stop discovering once the ledger holds this many entries
    #[arg(long, env = "TESTIMONY_MAX_DOCUMENTS", default_value_t = 5_000)]
    pub max_documents: u64,

    /// Fetch attempts before an entry is failed
    #[arg(long, env = "TESTIMONY_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Per-fetch timeout in seconds
    #[arg(long, env = "TESTIMONY_FETCH_TIMEOUT", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Claim lease in seconds; must exceed the fetch timeout
    #[arg(long, env = "TESTIMONY_LEASE", default_value_t = 300)]
    pub lease_secs: u64,
}

impl CrawlArgs {
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::new()
            .with_workers(self.workers)
            .with_max_in_flight(self.max_in_flight)
            .with_requests_per_second(self.rps)
            .with_max_depth(self.max_depth)
            .with_max_links_per_page(self.max_links)
            .with_max_documents(self.max_documents)
            .with_fetch_timeout(Duration::from_secs(self.timeout_secs))
            .with_lease(Duration::from_secs(self.lease_secs))
            .with_retry(RetryPolicy::new().with_max_attempts(self.retries))
    }
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Chat model used by the reasoner
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o")]
    pub model: String,

    /// Units extracted at once
    #[arg(long, env = "TESTIMONY_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Documents materialized into one unit
    #[arg(long, env = "TESTIMONY_DOCUMENTS_PER_UNIT", default_value_t = 1)]
    pub documents_per_unit: usize,

    /// Exploration rounds per unit
    #[arg(long, env = "TESTIMONY_MAX_ROUNDS", default_value_t = 8)]
    pub max_rounds: usize,

    /// Re-drafts after a draft fails validation
    #[arg(long, env = "TESTIMONY_REPAIR_ROUNDS", default_value_t = 2)]
    pub repair_rounds: usize,

    /// Attempts per reasoner call on transient failure
    #[arg(long, env = "TESTIMONY_REASONER_RETRIES", default_value_t = 3)]
    pub reasoner_retries: u32,

    /// Per-call reasoner timeout in seconds
    #[arg(long, env = "TESTIMONY_REASONER_TIMEOUT", default_value_t = 180)]
    pub reasoner_timeout_secs: u64,

    /// Extract again even where records exist
    #[arg(long)]
    pub reextract: bool,
}

impl ExtractArgs {
    pub fn extract_config(&self) -> ExtractConfig {
        let agent = AgentConfig::new()
            .with_max_rounds(self.max_rounds)
            .with_max_repair_rounds(self.repair_rounds)
            .with_reasoner_retry(RetryPolicy::new().with_max_attempts(self.reasoner_retries))
            .with_reasoner_timeout(Duration::from_secs(self.reasoner_timeout_secs));

        ExtractConfig::new()
            .with_concurrency(self.concurrency)
            .with_documents_per_unit(self.documents_per_unit)
            .with_reextract(self.reextract)
            .with_agent(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        crawl: CrawlArgs,
    }

    #[test]
    fn test_defaults_form_a_valid_fetch_config() {
        let harness = Harness::parse_from(["testimony"]);
        let config = harness.crawl.fetch_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_lease_shorter_than_timeout_is_rejected() {
        let harness = Harness::parse_from(["testimony", "--lease-secs", "60"]);
        assert!(harness.crawl.fetch_config().validate().is_err());
    }
}
