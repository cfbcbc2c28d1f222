//! Crawler implementations and fetch throttling.
//!
//! - `FirecrawlCrawler` - Scrapes pages to markdown through the Firecrawl API (requires `firecrawl` feature)
//! - `RobotsCrawler` - Wrapper that honours robots.txt
//! - `ValidatedCrawler` - Wrapper that validates URLs for security
//! - `Throttle` - Shared in-flight ceiling and request rate for the fetch pool

#[cfg(feature = "firecrawl")]
pub mod firecrawl;
pub mod robots;
pub mod throttle;

#[cfg(feature = "firecrawl")]
pub use firecrawl::FirecrawlCrawler;
pub use robots::{fetch_robots_txt, RobotsCrawler, RobotsTxt};
pub use throttle::Throttle;

// Re-export the validated crawler from traits
pub use crate::traits::crawler::{UrlValidator, ValidatedCrawler};
