//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the testimony library
//! without making real network or language model calls.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{CrawlError, CrawlResult, ReasonError, ReasonResult};
use crate::pipeline::context::Span;
use crate::traits::{
    crawler::Crawler,
    reasoner::{Action, DraftRequest, ExploreRequest, Reasoner},
};
use crate::types::{
    document::FetchedPage,
    record::{Draft, FieldViolation},
};

/// A scripted crawl failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Server(u16),
    NotFound,
    Unauthorized,
}

impl MockFailure {
    fn into_error(self, url: &str) -> CrawlError {
        match self {
            MockFailure::Timeout => CrawlError::Timeout {
                url: url.to_string(),
            },
            MockFailure::Server(status) => CrawlError::Server {
                url: url.to_string(),
                status,
            },
            MockFailure::NotFound => CrawlError::NotFound {
                url: url.to_string(),
            },
            MockFailure::Unauthorized => CrawlError::Unauthorized {
                message: "mock credentials rejected".to_string(),
            },
        }
    }
}

/// A mock crawler for testing.
///
/// Returns predefined pages without making network requests. A URL with no
/// page answers `NotFound`.
#[derive(Default)]
pub struct MockCrawler {
    /// Predefined pages by requested URL
    pages: Arc<RwLock<HashMap<String, FetchedPage>>>,

    /// Failures to return before the page, consumed in order
    failures: Arc<RwLock<HashMap<String, VecDeque<MockFailure>>>>,

    /// Simulated latency of every fetch
    delay: Option<Duration>,

    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,

    /// Call tracking
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockCrawler {
    /// Create a new mock crawler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `page` when `url` is fetched.
    pub fn with_page(self, url: impl Into<String>, page: FetchedPage) -> Self {
        self.pages.write().unwrap().insert(url.into(), page);
        self
    }

    /// Serve a page whose final URL is the requested one.
    pub fn with_body(self, url: &str, body: impl Into<String>) -> Self {
        self.with_page(url, FetchedPage::new(url, body))
    }

    /// Fail the next fetches of `url` with these failures, in order.
    pub fn with_failures(
        self,
        url: impl Into<String>,
        failures: impl IntoIterator<Item = MockFailure>,
    ) -> Self {
        self.failures
            .write()
            .unwrap()
            .entry(url.into())
            .or_default()
            .extend(failures);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every URL fetched, in call order.
    pub fn fetched_urls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    /// How many times `url` was fetched.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.calls.read().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Highest number of fetches that were in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Crawler for MockCrawler {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage> {
        self.calls.write().unwrap().push(url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .write()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = scripted {
            return Err(failure.into_error(url));
        }

        self.pages
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::NotFound {
                url: url.to_string(),
            })
    }
}

type DraftFn = dyn Fn(&DraftRequest<'_>) -> ReasonResult<Vec<Draft>> + Send + Sync;

/// Record of a call made to the mock reasoner.
#[derive(Debug, Clone)]
pub enum MockReasonerCall {
    NextAction {
        round: usize,
        observations: usize,
    },
    Draft {
        attempt: usize,
        spans: Vec<Span>,
        violations: Vec<FieldViolation>,
    },
}

/// A scripted reasoner for testing.
///
/// Actions and drafts are replayed in the order they were scripted. Once
/// the action script runs out every call answers `Finish`; once the draft
/// script runs out the draft function is used, or no drafts at all.
#[derive(Default)]
pub struct MockReasoner {
    actions: Arc<RwLock<VecDeque<ReasonResult<Action>>>>,
    drafts: Arc<RwLock<VecDeque<ReasonResult<Vec<Draft>>>>>,
    draft_fn: Option<Arc<DraftFn>>,

    /// Call tracking for assertions
    calls: Arc<RwLock<Vec<MockReasonerCall>>>,
}

impl MockReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_action(self, action: Action) -> Self {
        self.actions.write().unwrap().push_back(Ok(action));
        self
    }

    pub fn then_actions(self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions
            .write()
            .unwrap()
            .extend(actions.into_iter().map(Ok));
        self
    }

    pub fn then_action_error(self, error: ReasonError) -> Self {
        self.actions.write().unwrap().push_back(Err(error));
        self
    }

    pub fn then_drafts(self, drafts: Vec<Draft>) -> Self {
        self.drafts.write().unwrap().push_back(Ok(drafts));
        self
    }

    pub fn then_draft_error(self, error: ReasonError) -> Self {
        self.drafts.write().unwrap().push_back(Err(error));
        self
    }

    /// Answer drafting calls with `f` once the scripted drafts run out.
    pub fn with_draft_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&DraftRequest<'_>) -> ReasonResult<Vec<Draft>> + Send + Sync + 'static,
    {
        self.draft_fn = Some(Arc::new(f));
        self
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockReasonerCall> {
        self.calls.read().unwrap().clone()
    }

    /// Number of exploration calls made.
    pub fn action_calls(&self) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, MockReasonerCall::NextAction { .. }))
            .count()
    }

    /// Number of drafting calls made.
    pub fn draft_calls(&self) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, MockReasonerCall::Draft { .. }))
            .count()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn next_action(&self, request: &ExploreRequest<'_>) -> ReasonResult<Action> {
        self.calls.write().unwrap().push(MockReasonerCall::NextAction {
            round: request.round,
            observations: request.observations.len(),
        });

        let scripted = self.actions.write().unwrap().pop_front();
        scripted.unwrap_or(Ok(Action::Finish))
    }

    async fn draft(&self, request: &DraftRequest<'_>) -> ReasonResult<Vec<Draft>> {
        self.calls.write().unwrap().push(MockReasonerCall::Draft {
            attempt: request.attempt,
            spans: request.spans.to_vec(),
            violations: request.violations.to_vec(),
        });

        let scripted = self.drafts.write().unwrap().pop_front();
        match (scripted, &self.draft_fn) {
            (Some(result), _) => result,
            (None, Some(f)) => f(request),
            (None, None) => Ok(Vec::new()),
        }
    }
}

/// A draft that passes validation, citing `evidence` in context offsets.
pub fn valid_draft(evidence: Range<usize>) -> Draft {
    Draft::new()
        .with("condition", "ME/CFS")
        .with("onset", "since-2018")
        .with(
            "threat_to_personhood",
            "I am no longer the person who ran the bakery.",
        )
        .with(
            "description",
            "Post-exertional crashes after ordinary errands.",
        )
        .with("narrative_fragment", "Some days I cannot lift the kettle.")
        .with(
            "evidence",
            serde_json::json!([{"start": evidence.start, "end": evidence.end}]),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_crawler_replays_failures_then_page() {
        let crawler = MockCrawler::new()
            .with_body("https://forum.example/t/1", "story")
            .with_failures("https://forum.example/t/1", [MockFailure::Server(503)]);

        let err = crawler.fetch("https://forum.example/t/1").await.unwrap_err();
        assert!(matches!(err, CrawlError::Server { status: 503, .. }));

        let page = crawler.fetch("https://forum.example/t/1").await.unwrap();
        assert_eq!(page.body, "story");
        assert_eq!(crawler.fetch_count("https://forum.example/t/1"), 2);

        let err = crawler.fetch("https://forum.example/t/2").await.unwrap_err();
        assert!(matches!(err, CrawlError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_mock_reasoner_finishes_when_script_runs_out() {
        let reasoner = MockReasoner::new().then_action(Action::Overview);
        let request = ExploreRequest {
            documents: &[],
            round: 0,
            max_rounds: 3,
            observations: &[],
        };

        assert_eq!(reasoner.next_action(&request).await.unwrap(), Action::Overview);
        assert_eq!(reasoner.next_action(&request).await.unwrap(), Action::Finish);
        assert_eq!(reasoner.action_calls(), 2);
    }
}
