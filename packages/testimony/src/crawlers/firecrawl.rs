//! Firecrawl-based crawler.
//!
//! Scrapes one page at a time through the Firecrawl API, which renders
//! JavaScript-heavy forum pages and returns markdown plus outbound links.
//!
//! Requires the `firecrawl` feature to be enabled.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::discovery::is_auth_error;
use crate::error::{CrawlError, CrawlResult};
use crate::security::ServiceCredentials;
use crate::traits::crawler::Crawler;
use crate::types::document::FetchedPage;

const FIRECRAWL_API_URL: &str = "https://api.firecrawl.dev/v1";

/// Firecrawl-based crawler.
///
/// # Example
///
/// ```rust,ignore
/// use testimony::crawlers::{FirecrawlCrawler, RobotsCrawler, ValidatedCrawler};
///
/// let crawler = RobotsCrawler::new(ValidatedCrawler::new(FirecrawlCrawler::from_env()?));
/// let page = crawler.fetch("https://forums.phoenixrising.me/threads/topic.1").await?;
/// ```
pub struct FirecrawlCrawler {
    client: Client,
    credentials: ServiceCredentials,
    only_main_content: bool,
}

// Request/Response types for Firecrawl API

#[derive(Serialize)]
struct ScrapeRequest<'a> {
    url: &'a str,
    formats: [&'static str; 2],
    #[serde(rename = "onlyMainContent")]
    only_main_content: bool,
}

#[derive(Deserialize)]
struct ScrapeResponse {
    success: bool,
    data: Option<ScrapeData>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ScrapeData {
    markdown: Option<String>,
    #[serde(default)]
    links: Vec<String>,
    metadata: Option<PageMetadata>,
}

#[derive(Deserialize)]
struct PageMetadata {
    title: Option<String>,
    /// Final URL after redirects
    url: Option<String>,
    #[serde(rename = "sourceURL")]
    source_url: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<u16>,
}

impl FirecrawlCrawler {
    pub fn new(credentials: ServiceCredentials) -> CrawlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CrawlError::Http(Box::new(e)))?;

        Ok(Self {
            client,
            credentials,
            only_main_content: true,
        })
    }

    /// Create from environment variable `FIRECRAWL_API_KEY`.
    pub fn from_env() -> crate::error::Result<Self> {
        let credentials = ServiceCredentials::from_env("FIRECRAWL_API_KEY")?;
        Ok(Self::new(credentials)?)
    }

    /// Keep page chrome (navigation, sidebars) in the markdown.
    pub fn with_full_page(mut self) -> Self {
        self.only_main_content = false;
        self
    }

    async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &T,
        target: &str,
    ) -> CrawlResult<R> {
        let url = format!(
            "{}{}",
            self.credentials.base_url_or(FIRECRAWL_API_URL),
            endpoint
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credentials.api_key.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlError::Timeout {
                        url: target.to_string(),
                    }
                } else {
                    CrawlError::Http(Box::new(e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(api_error(target, status, text));
        }

        response
            .json()
            .await
            .map_err(|e| CrawlError::Http(Box::new(e)))
    }
}

/// Map a non-success answer from the API itself.
fn api_error(target: &str, status: StatusCode, text: String) -> CrawlError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::PAYMENT_REQUIRED => {
            CrawlError::Unauthorized {
                message: format!("Firecrawl API {status}: {text}"),
            }
        }
        StatusCode::TOO_MANY_REQUESTS => CrawlError::RateLimitExceeded,
        _ if is_auth_error(&text) => CrawlError::Unauthorized {
            message: format!("Firecrawl API {status}: {text}"),
        },
        _ => CrawlError::Server {
            url: target.to_string(),
            status: status.as_u16(),
        },
    }
}

/// Turn a scrape response into a page, or a typed error for the target.
fn into_page(target: &str, response: ScrapeResponse) -> CrawlResult<FetchedPage> {
    if !response.success {
        let message = response.error.unwrap_or_else(|| "scrape failed".to_string());
        if is_auth_error(&message) {
            return Err(CrawlError::Unauthorized { message });
        }
        return Err(CrawlError::Http(message.into()));
    }

    let data = response
        .data
        .ok_or_else(|| CrawlError::Http("no data returned from Firecrawl".into()))?;
    let metadata = data.metadata;

    if let Some(code) = metadata.as_ref().and_then(|m| m.status_code) {
        if code >= 400 {
            return Err(CrawlError::from_status(target, code));
        }
    }

    let final_url = metadata
        .as_ref()
        .and_then(|m| m.url.clone().or_else(|| m.source_url.clone()))
        .unwrap_or_else(|| target.to_string());

    let mut page = FetchedPage::new(final_url, data.markdown.unwrap_or_default())
        .with_links(data.links);
    if let Some(title) = metadata.and_then(|m| m.title) {
        page = page.with_title(title);
    }
    Ok(page)
}

#[async_trait]
impl Crawler for FirecrawlCrawler {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage> {
        let request = ScrapeRequest {
            url,
            formats: ["markdown", "links"],
            only_main_content: self.only_main_content,
        };

        let response: ScrapeResponse = self.post("/scrape", &request, url).await?;
        let page = into_page(url, response)?;

        tracing::debug!(
            url,
            chars = page.body.len(),
            links = page.links.len(),
            "Scraped page"
        );
        Ok(page)
    }
}
