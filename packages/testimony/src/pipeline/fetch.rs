//! Fetch worker pool.
//!
//! A fixed number of workers loop claim → fetch → record against the
//! ledger until nothing is outstanding or the run is cancelled. The ledger
//! is the only thing workers share; the throttle bounds what they may
//! send, independent of how many there are.
//!
//! # Architecture
//!
//! ```text
//! FetchPool
//!     │
//!     ├─► claim_batch (ledger, leased)
//!     ├─► Throttle (in-flight slots + rate limiter) ─► extend_lease
//!     ├─► Crawler::fetch under timeout, lease extended every heartbeat
//!     ├─► inspect_content ─► rank_links ─► enqueue children
//!     └─► RawStore::put ─► complete | fail (ledger decides retry vs failed)
//! ```

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::crawlers::Throttle;
use crate::discovery::{canonicalize_url, inspect_content, rank_links, ContentVerdict, SEED_PRIORITY};
use crate::error::{
    ConfigError, CrawlError, CrawlResult, FailureClass, LedgerError, LedgerResult, PipelineError,
    Result, StoreError,
};
use crate::traits::{crawler::Crawler, ledger::Ledger, store::RawStore};
use crate::types::{
    config::FetchConfig,
    document::FetchedPage,
    entry::{Claim, EnqueueOutcome, EntryStatus, FailureKind, LeaseToken, LedgerEntry, NewEntry},
    source::{SourceRegistry, SourceSeed},
};

/// Error recorded against listing pages whose links were followed.
pub const DIRECTORY_PAGE: &str = "directory page: links followed, body not stored";

/// Counts for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub claimed: u64,
    /// Bodies stored and entries marked done
    pub completed: u64,
    /// Transient failures returned to pending
    pub retried: u64,
    /// Entries that ended failed
    pub failed: u64,
    /// Listing pages whose links were followed
    pub directories: u64,
    pub links_enqueued: u64,
    /// Results discarded because the lease was lost
    pub conflicts: u64,
    /// The run stopped on cancellation
    pub cancelled: bool,
}

impl CrawlSummary {
    fn absorb(&mut self, other: CrawlSummary) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.directories += other.directories;
        self.links_enqueued += other.links_enqueued;
        self.conflicts += other.conflicts;
    }

    /// Whether any item ended failed.
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// The fetch worker pool.
pub struct FetchPool<L, C, S> {
    ledger: Arc<L>,
    crawler: Arc<C>,
    raw: Arc<S>,
    sources: Arc<SourceRegistry>,
    config: FetchConfig,
}

impl<L, C, S> FetchPool<L, C, S>
where
    L: Ledger + 'static,
    C: Crawler + 'static,
    S: RawStore + 'static,
{
    pub fn new(
        ledger: Arc<L>,
        crawler: Arc<C>,
        raw: Arc<S>,
        config: FetchConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ledger,
            crawler,
            raw,
            sources: Arc::new(SourceRegistry::default()),
            config,
        })
    }

    /// Link rules per source; entries from unknown sources get default rules.
    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Arc::new(sources);
        self
    }

    /// Enqueue every registry seed at depth 0 with the top priority.
    ///
    /// Seeds whose URL cannot be canonicalized are skipped with a warning.
    /// Returns the number of seeds that were new to the ledger.
    pub async fn seed(&self) -> LedgerResult<usize> {
        let mut inserted = 0;
        for seed in self.sources.seeds() {
            let Some(url) = canonicalize_url(&seed.url) else {
                warn!(name = %seed.name, url = %seed.url, "Skipping seed with invalid URL");
                continue;
            };
            let outcome = self
                .ledger
                .enqueue(NewEntry::new(url, &seed.name).with_priority(SEED_PRIORITY))
                .await?;
            if outcome == EnqueueOutcome::Inserted {
                inserted += 1;
            }
        }
        info!(seeds = self.sources.len(), inserted, "Seeded ledger");
        Ok(inserted)
    }

    /// Run the pool until no work is outstanding or `cancel` fires.
    ///
    /// Per-item failures are recorded in the ledger and counted. A fatal
    /// failure in any worker stops every worker and is returned; leases of
    /// entries left in progress expire and are reclaimed by the next run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<CrawlSummary> {
        let throttle = Throttle::from_config(&self.config)?;
        let stop = cancel.child_token();

        info!(
            workers = self.config.workers,
            max_in_flight = self.config.max_in_flight,
            requests_per_second = self.config.requests_per_second,
            "Fetch pool starting"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let worker = Worker {
                ledger: self.ledger.clone(),
                crawler: self.crawler.clone(),
                raw: self.raw.clone(),
                sources: self.sources.clone(),
                config: self.config.clone(),
                throttle: throttle.clone(),
                stop: stop.clone(),
            };
            workers.spawn(
                worker
                    .run()
                    .instrument(tracing::info_span!("fetch_worker", worker = id)),
            );
        }

        let mut summary = CrawlSummary::default();
        let mut fatal: Option<PipelineError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| PipelineError::Worker(e.to_string()))
                .and_then(|r| r);
            match result {
                Ok(part) => summary.absorb(part),
                Err(e) if fatal.is_none() => {
                    error!(error = %e, "Fatal error, stopping every worker");
                    stop.cancel();
                    throttle.close();
                    fatal = Some(e);
                }
                Err(e) => debug!(error = %e, "Further worker error after abort"),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        summary.cancelled = cancel.is_cancelled();
        info!(
            claimed = summary.claimed,
            completed = summary.completed,
            retried = summary.retried,
            failed = summary.failed,
            directories = summary.directories,
            links = summary.links_enqueued,
            cancelled = summary.cancelled,
            "Fetch pool finished"
        );
        Ok(summary)
    }
}

struct Worker<L, C, S> {
    ledger: Arc<L>,
    crawler: Arc<C>,
    raw: Arc<S>,
    sources: Arc<SourceRegistry>,
    config: FetchConfig,
    throttle: Throttle,
    stop: CancellationToken,
}

impl<L: Ledger, C: Crawler, S: RawStore> Worker<L, C, S> {
    async fn run(self) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::default();

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let claims = self
                .ledger
                .claim_batch(self.config.claim_batch, self.config.lease)
                .await?;

            if claims.is_empty() {
                // In-progress entries may still discover links
                if self.ledger.outstanding().await? == 0 {
                    debug!("No outstanding work, worker exiting");
                    break;
                }
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            for claim in claims {
                if self.stop.is_cancelled() {
                    break;
                }
                let span = tracing::info_span!(
                    "fetch",
                    url = %claim.entry.id,
                    attempt = claim.entry.attempts + 1,
                    depth = claim.entry.depth
                );
                self.process(claim, &mut summary).instrument(span).await?;
            }
        }

        Ok(summary)
    }

    /// Wait for a throttle slot, restart the lease clock, then fetch while
    /// extending the lease every heartbeat.
    ///
    /// `Ok(None)` if the run stopped while waiting for the throttle. A lease
    /// lost before or during the fetch surfaces as a ledger error.
    async fn fetch(
        &self,
        url: &str,
        lease: &LeaseToken,
    ) -> LedgerResult<Option<CrawlResult<FetchedPage>>> {
        let permit = tokio::select! {
            _ = self.stop.cancelled() => return Ok(None),
            permit = self.throttle.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return Ok(None);
        };

        // Time spent queued behind other claims does not count against the lease
        self.ledger
            .extend_lease(url, lease, self.config.lease)
            .await?;

        let fetch = tokio::time::timeout(self.config.fetch_timeout, self.crawler.fetch(url));
        tokio::pin!(fetch);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                fetched = &mut fetch => {
                    return Ok(Some(fetched.unwrap_or_else(|_| {
                        Err(CrawlError::Timeout {
                            url: url.to_string(),
                        })
                    })));
                }
                _ = heartbeat.tick() => {
                    self.ledger
                        .extend_lease(url, lease, self.config.lease)
                        .await?;
                    debug!("Lease extended");
                }
            }
        }
    }

    async fn process(&self, claim: Claim, summary: &mut CrawlSummary) -> Result<()> {
        let Claim { entry, lease } = claim;
        summary.claimed += 1;

        let fetched = match self.fetch(&entry.id, &lease).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                debug!("Stopped before fetching, lease left to expire");
                return Ok(());
            }
            Err(e) => return self.lost_lease(e, summary),
        };

        let page = match fetched {
            Ok(page) => page,
            Err(e) if e.class() == FailureClass::Fatal => {
                error!(error = %e, "Fatal crawl error");
                return Err(e.into());
            }
            Err(e) => {
                let kind = match e.class() {
                    FailureClass::Transient => FailureKind::Transient,
                    _ => FailureKind::Permanent,
                };
                return self
                    .record_failure(&entry, &lease, &e.to_string(), kind, summary)
                    .await;
            }
        };

        match inspect_content(&page.url, &page.body) {
            ContentVerdict::Rejected(reason) => {
                let e = CrawlError::RejectedContent {
                    url: entry.id.clone(),
                    reason,
                };
                self.record_failure(&entry, &lease, &e.to_string(), FailureKind::Permanent, summary)
                    .await
            }
            ContentVerdict::Directory => {
                self.enqueue_links(&entry, &page, summary).await?;
                let result = self
                    .ledger
                    .fail(
                        &entry.id,
                        &lease,
                        DIRECTORY_PAGE,
                        FailureKind::Permanent,
                        &self.config.retry,
                    )
                    .await;
                match result {
                    Ok(_) => {
                        summary.directories += 1;
                        info!(links = page.links.len(), "Directory page, links followed");
                        Ok(())
                    }
                    Err(e) => self.lost_lease(e, summary),
                }
            }
            ContentVerdict::Testimony => {
                self.enqueue_links(&entry, &page, summary).await?;

                let hash = match self.raw.put(&entry.id, &page.body).await {
                    Ok(hash) => hash,
                    Err(StoreError::EmptyBody { .. }) => {
                        return self
                            .record_failure(
                                &entry,
                                &lease,
                                "empty body",
                                FailureKind::Permanent,
                                summary,
                            )
                            .await
                    }
                    Err(e) => return Err(e.into()),
                };

                match self.ledger.complete(&entry.id, &lease, &hash).await {
                    Ok(()) => {
                        summary.completed += 1;
                        info!(hash = %hash, chars = page.body.len(), "Fetched");
                        Ok(())
                    }
                    Err(e) => self.lost_lease(e, summary),
                }
            }
        }
    }

    async fn record_failure(
        &self,
        entry: &LedgerEntry,
        lease: &LeaseToken,
        error: &str,
        kind: FailureKind,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        let result = self
            .ledger
            .fail(&entry.id, lease, error, kind, &self.config.retry)
            .await;
        match result {
            Ok(EntryStatus::Pending) => {
                summary.retried += 1;
                warn!(error, "Fetch failed, will retry");
                Ok(())
            }
            Ok(_) => {
                summary.failed += 1;
                warn!(error, ?kind, "Fetch failed");
                Ok(())
            }
            Err(e) => self.lost_lease(e, summary),
        }
    }

    /// A conflict means another worker owns the entry now; anything else is fatal.
    fn lost_lease(&self, error: LedgerError, summary: &mut CrawlSummary) -> Result<()> {
        if !error.is_conflict() {
            return Err(error.into());
        }
        summary.conflicts += 1;
        warn!(error = %error, "Lease lost, result discarded");
        Ok(())
    }

    async fn enqueue_links(
        &self,
        entry: &LedgerEntry,
        page: &FetchedPage,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        if entry.depth >= self.config.max_depth || page.links.is_empty() {
            return Ok(());
        }

        let fallback;
        let seed = match self.sources.get(&entry.source_name) {
            Some(seed) => seed,
            None => {
                fallback = SourceSeed::new(&entry.source_name, &entry.id);
                &fallback
            }
        };
        let cap = seed.max_links.unwrap_or(self.config.max_links_per_page);
        let links = rank_links(&page.links, &page.url, seed, cap);
        if links.is_empty() {
            return Ok(());
        }

        let mut total = self.ledger.counts().await?.total();
        for link in links {
            if total >= self.config.max_documents {
                debug!(max = self.config.max_documents, "Document cap reached, discovery stopped");
                break;
            }
            let outcome = self
                .ledger
                .enqueue(
                    NewEntry::new(link.url, &entry.source_name)
                        .with_depth(entry.depth + 1)
                        .with_priority(link.score),
                )
                .await?;
            if outcome == EnqueueOutcome::Inserted {
                total += 1;
                summary.links_enqueued += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::stores::MemoryRawStore;
    use crate::testing::{MockCrawler, MockFailure};
    use crate::types::config::RetryPolicy;
    use std::time::Duration;

    const STORY: &str = "I have lived with ME/CFS since 2018. This is my story.";

    fn config() -> FetchConfig {
        FetchConfig::new()
            .with_workers(3)
            .with_requests_per_second(1_000)
            .with_poll_interval(Duration::from_millis(5))
            .with_max_depth(1)
            .with_retry(RetryPolicy::immediate(3))
    }

    /// Leases short enough to expire while a claim waits for the throttle.
    fn tight_lease_config() -> FetchConfig {
        config()
            .with_max_in_flight(1)
            .with_fetch_timeout(Duration::from_millis(100))
            .with_lease(Duration::from_millis(120))
            .with_heartbeat(Duration::from_millis(30))
    }

    fn ledger() -> Arc<MemoryLedger> {
        Arc::new(MemoryLedger::new())
    }

    fn seeded(url: &str) -> SourceRegistry {
        SourceRegistry::new(vec![SourceSeed::new("forum", url)])
    }

    async fn run(
        ledger: Arc<MemoryLedger>,
        crawler: MockCrawler,
        sources: SourceRegistry,
        config: FetchConfig,
    ) -> (Result<CrawlSummary>, Arc<MockCrawler>, Arc<MemoryRawStore>) {
        let crawler = Arc::new(crawler);
        let raw = Arc::new(MemoryRawStore::new());
        let pool = FetchPool::new(ledger, crawler.clone(), raw.clone(), config)
            .unwrap()
            .with_sources(sources);
        pool.seed().await.unwrap();
        let result = pool.run(CancellationToken::new()).await;
        (result, crawler, raw)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crawls_seed_and_discovered_threads() {
        let seed = "https://forum.example/threads/my-story.1";
        let crawler = MockCrawler::new()
            .with_page(
                seed,
                FetchedPage::new(seed, STORY).with_links(vec![
                    "/threads/living-with-pots.2".into(),
                    "https://forum.example/threads/my-story.1/page-2".into(),
                    "https://forum.example/login".into(),
                    "https://elsewhere.example/threads/3".into(),
                ]),
            )
            .with_body("https://forum.example/threads/living-with-pots.2", STORY);
        let ledger = ledger();

        let (result, crawler, raw) = run(ledger.clone(), crawler, seeded(seed), config()).await;
        let summary = result.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.links_enqueued, 1);
        assert_eq!(crawler.fetched_urls().len(), 2);
        // Identical bodies collapse to one document
        assert_eq!(raw.len(), 1);

        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts.done, 2);
        let entry = ledger
            .get("https://forum.example/threads/living-with-pots.2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.depth, 1);
        assert!(entry.content_hash.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let seed = "https://forum.example/threads/1";
        let crawler = MockCrawler::new()
            .with_body(seed, STORY)
            .with_failures(seed, [MockFailure::Server(503), MockFailure::Timeout]);

        let (result, crawler, _) = run(ledger(), crawler, seeded(seed), config()).await;
        let summary = result.unwrap();

        assert_eq!(summary.retried, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(crawler.fetch_count(seed), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_fails_entry() {
        let seed = "https://forum.example/threads/1";
        let crawler = MockCrawler::new().with_body(seed, STORY).with_failures(
            seed,
            [
                MockFailure::Server(502),
                MockFailure::Server(502),
                MockFailure::Server(502),
            ],
        );
        let ledger = ledger();

        let (result, _, raw) = run(ledger.clone(), crawler, seeded(seed), config()).await;
        let summary = result.unwrap();

        assert_eq!(summary.failed, 1);
        assert!(summary.has_failures());
        assert_eq!(raw.len(), 0);
        let entry = ledger.get(seed).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_comes_from_fetch_config() {
        let seed = "https://forum.example/threads/1";
        let crawler = MockCrawler::new()
            .with_body(seed, STORY)
            .with_failures(seed, [MockFailure::Server(503)]);
        let ledger = ledger();

        let config = config().with_retry(RetryPolicy::immediate(1));
        let (result, crawler, _) = run(ledger.clone(), crawler, seeded(seed), config).await;
        let summary = result.unwrap();

        assert_eq!(summary.retried, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(crawler.fetch_count(seed), 1);
        let entry = ledger.get(seed).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_recorded() {
        let seed = "https://forum.example/threads/1";
        let crawler = MockCrawler::new().with_page(
            seed,
            FetchedPage::new(seed, "Oops! We ran into some problems. Please try again later."),
        );
        let ledger = ledger();

        let (result, crawler, raw) = run(ledger.clone(), crawler, seeded(seed), config()).await;
        assert_eq!(result.unwrap().failed, 1);
        assert_eq!(crawler.fetch_count(seed), 1);
        assert!(raw.is_empty());

        let entry = ledger.get(seed).await.unwrap().unwrap();
        assert!(entry.last_error.unwrap().contains("error page"));
    }

    #[tokio::test]
    async fn test_unauthorized_aborts_the_run() {
        let seed = "https://forum.example/threads/1";
        let crawler = MockCrawler::new().with_failures(seed, [MockFailure::Unauthorized]);

        let (result, _, _) = run(ledger(), crawler, seeded(seed), config()).await;
        assert!(matches!(result, Err(PipelineError::Crawl(_))));
    }

    #[tokio::test]
    async fn test_depth_and_document_caps() {
        let seed = "https://forum.example/threads/my-story.1";
        let links: Vec<String> = (2..10)
            .map(|i| format!("https://forum.example/threads/story.{i}"))
            .collect();
        let crawler = MockCrawler::new().with_page(seed, FetchedPage::new(seed, STORY).with_links(links));

        let (result, _, _) = run(
            ledger(),
            crawler,
            seeded(seed),
            config().with_max_documents(4),
        )
        .await;
        let summary = result.unwrap();
        assert_eq!(summary.links_enqueued, 3);
        // Discovered pages are not in the mock, so they fail as not found
        assert_eq!(summary.failed, 3);

        let crawler = MockCrawler::new().with_page(
            seed,
            FetchedPage::new(seed, STORY).with_links(vec!["/threads/story.2".into()]),
        );
        let (result, _, _) = run(ledger(), crawler, seeded(seed), config().with_max_depth(0)).await;
        assert_eq!(result.unwrap().links_enqueued, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_ceiling_is_independent_of_workers() {
        let ledger = ledger();
        let mut crawler = MockCrawler::new().with_delay(Duration::from_millis(20));
        for i in 0..12 {
            let url = format!("https://forum.example/threads/{i}");
            ledger.enqueue(NewEntry::new(&url, "forum")).await.unwrap();
            crawler = crawler.with_body(&url, format!("{STORY} ({i})"));
        }

        let config = config().with_workers(8).with_max_in_flight(2);
        let (result, crawler, raw) = run(ledger, crawler, SourceRegistry::default(), config).await;

        assert_eq!(result.unwrap().completed, 12);
        assert_eq!(raw.len(), 12);
        assert!(crawler.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_claims_nothing() {
        let ledger = ledger();
        ledger
            .enqueue(NewEntry::new("https://forum.example/threads/1", "forum"))
            .await
            .unwrap();
        let pool = FetchPool::new(
            ledger.clone(),
            Arc::new(MockCrawler::new()),
            Arc::new(MemoryRawStore::new()),
            config(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = pool.run(cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.claimed, 0);
        assert_eq!(ledger.counts().await.unwrap().pending, 1);
    }

    async fn enqueue_stories(
        ledger: &MemoryLedger,
        mut crawler: MockCrawler,
        n: usize,
    ) -> (MockCrawler, Vec<String>) {
        let mut urls = Vec::new();
        for i in 0..n {
            let url = format!("https://forum.example/threads/story.{i}");
            ledger.enqueue(NewEntry::new(&url, "forum")).await.unwrap();
            crawler = crawler.with_body(&url, format!("{STORY} ({i})"));
            urls.push(url);
        }
        (crawler, urls)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lease_outlives_wait_for_throttle() {
        let ledger = ledger();
        let crawler = MockCrawler::new().with_delay(Duration::from_millis(80));
        let (crawler, urls) = enqueue_stories(&ledger, crawler, 3).await;

        // The third claim waits 160ms for its slot, past its original lease
        let config = tight_lease_config().with_workers(3);
        assert!(config.validate().is_ok());
        let (result, crawler, raw) =
            run(ledger.clone(), crawler, SourceRegistry::default(), config).await;
        let summary = result.unwrap();

        for url in &urls {
            assert_eq!(crawler.fetch_count(url), 1, "{url} fetched twice");
        }
        assert_eq!(summary.completed, 3);
        assert_eq!(raw.len(), 3);
        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts.done, 3);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batched_claims_fetch_each_entry_once() {
        let ledger = ledger();
        let crawler = MockCrawler::new().with_delay(Duration::from_millis(30));
        let (crawler, urls) = enqueue_stories(&ledger, crawler, 6).await;

        let config = tight_lease_config()
            .with_workers(2)
            .with_claim_batch(3)
            .with_fetch_timeout(Duration::from_millis(50))
            .with_lease(Duration::from_millis(70))
            .with_heartbeat(Duration::from_millis(20));
        let (result, crawler, _) =
            run(ledger.clone(), crawler, SourceRegistry::default(), config).await;

        assert_eq!(result.unwrap().completed, 6);
        for url in &urls {
            assert_eq!(crawler.fetch_count(url), 1, "{url} fetched twice");
        }
        assert_eq!(ledger.counts().await.unwrap().done, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_discovery_of_one_thread() {
        let first = "https://forum.example/threads/my-story.1";
        let second = "https://forum.example/threads/living-with-pots.2";
        let shared = "https://forum.example/threads/shared-story.5";

        let ledger = ledger();
        ledger
            .enqueue(NewEntry::new(second, "forum").with_priority(SEED_PRIORITY))
            .await
            .unwrap();

        let crawler = MockCrawler::new()
            .with_delay(Duration::from_millis(20))
            .with_page(
                first,
                FetchedPage::new(first, STORY)
                    .with_links(vec!["/threads/shared-story.5/page-2".into()]),
            )
            .with_page(
                second,
                FetchedPage::new(second, format!("{STORY} Again.")).with_links(vec![
                    "https://forum.example/threads/shared-story.5?utm_source=feed#post-9".into(),
                ]),
            )
            .with_body(shared, format!("{STORY} Shared."));

        let config = config().with_workers(2).with_max_in_flight(2);
        let (result, crawler, _) = run(ledger.clone(), crawler, seeded(first), config).await;
        let summary = result.unwrap();

        assert_eq!(summary.links_enqueued, 1);
        assert_eq!(summary.completed, 3);
        assert_eq!(crawler.fetch_count(shared), 1);
        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.done, 3);
    }
}
