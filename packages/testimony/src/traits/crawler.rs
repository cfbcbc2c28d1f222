//! Crawler trait and URL validation for SSRF protection.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{CrawlError, CrawlResult, SecurityError, SecurityResult};
use crate::types::document::FetchedPage;

/// The crawl capability: fetch one document by identifier.
///
/// Implementations report failures through typed [`CrawlError`] variants so
/// the fetch pool can tell transient from permanent from fatal.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage>;
}

#[async_trait]
impl<C: Crawler + ?Sized> Crawler for std::sync::Arc<C> {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage> {
        (**self).fetch(url).await
    }
}

/// URL validator for SSRF protection.
///
/// Forum links are attacker-controlled input. Before any of them is
/// fetched, the validator rejects:
/// - non-HTTP(S) schemes
/// - loopback, private and link-local addresses (including cloud metadata)
/// - hostnames that resolve into those ranges
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<ipnet::IpNet>,
    /// Bypass every other check
    allowed_hosts: HashSet<String>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "::1",
    "[::1]",
    "0.0.0.0",
    "metadata.google.internal",
    "metadata.gke.internal",
    "instance-data",
];

const BLOCKED_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "127.0.0.0/8",
    "0.0.0.0/8",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

impl UrlValidator {
    /// Create a new URL validator with default security rules.
    pub fn new() -> Self {
        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            blocked_cidrs: BLOCKED_CIDRS
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect(),
            allowed_hosts: HashSet::new(),
        }
    }

    /// Add an allowed host (bypasses validation).
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    /// Block an additional host.
    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into());
        self
    }

    /// Block an additional CIDR range.
    pub fn block_cidr(mut self, cidr: ipnet::IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    fn check_ip(&self, ip: IpAddr, context: &str) -> SecurityResult<()> {
        match self.blocked_cidrs.iter().find(|cidr| cidr.contains(&ip)) {
            Some(_) if context.is_empty() => Err(SecurityError::BlockedCidr(ip.to_string())),
            Some(_) => Err(SecurityError::BlockedCidr(format!(
                "{context} resolved to blocked IP {ip}"
            ))),
            None => Ok(()),
        }
    }

    /// Validate a URL without touching the network.
    pub fn validate(&self, url: &str) -> SecurityResult<()> {
        let parsed = url::Url::parse(url)?;

        if !self.allowed_schemes.contains(parsed.scheme()) {
            return Err(SecurityError::DisallowedScheme(parsed.scheme().to_string()));
        }

        let host = parsed.host_str().ok_or(SecurityError::NoHost)?;
        if self.allowed_hosts.contains(host) {
            return Ok(());
        }
        if self.blocked_hosts.contains(host) {
            return Err(SecurityError::BlockedHost(host.to_string()));
        }

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            self.check_ip(ip, "")?;
        }

        Ok(())
    }

    /// Validate a URL and resolve DNS to check the actual IP.
    ///
    /// Catches hostnames that resolve to internal addresses.
    pub async fn validate_with_dns(&self, url: &str) -> SecurityResult<()> {
        self.validate(url)?;

        let parsed = url::Url::parse(url)?;
        let host = parsed.host_str().ok_or(SecurityError::NoHost)?;
        if self.allowed_hosts.contains(host) || host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let port = parsed.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SecurityError::DnsResolution(e.to_string()))?;

        for addr in addrs {
            self.check_ip(addr.ip(), &format!("DNS for {host}"))?;
        }

        Ok(())
    }
}

/// A crawler that validates URLs before fetching.
///
/// Both the requested URL and the URL the page was finally served from are
/// checked, so a redirect into a private range is rejected too.
pub struct ValidatedCrawler<C: Crawler> {
    inner: C,
    validator: UrlValidator,
    resolve_dns: bool,
}

impl<C: Crawler> ValidatedCrawler<C> {
    pub fn new(crawler: C) -> Self {
        Self {
            inner: crawler,
            validator: UrlValidator::new(),
            resolve_dns: true,
        }
    }

    pub fn with_validator(crawler: C, validator: UrlValidator) -> Self {
        Self {
            inner: crawler,
            validator,
            resolve_dns: true,
        }
    }

    /// Skip DNS resolution (for offline use and tests).
    pub fn without_dns(mut self) -> Self {
        self.resolve_dns = false;
        self
    }
}

#[async_trait]
impl<C: Crawler> Crawler for ValidatedCrawler<C> {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage> {
        if self.resolve_dns {
            self.validator.validate_with_dns(url).await?;
        } else {
            self.validator.validate(url)?;
        }

        let page = self.inner.fetch(url).await?;
        if page.url != url {
            self.validator
                .validate(&page.url)
                .map_err(CrawlError::Security)?;
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCrawler;

    #[test]
    fn test_blocks_localhost() {
        let validator = UrlValidator::new();
        assert!(validator.validate("http://localhost/").is_err());
        assert!(validator.validate("http://127.0.0.1/").is_err());
        assert!(validator.validate("http://[::1]/").is_err());
    }

    #[test]
    fn test_blocks_private_and_metadata_ranges() {
        let validator = UrlValidator::new();
        assert!(validator.validate("http://10.0.0.1/").is_err());
        assert!(validator.validate("http://192.168.1.1/").is_err());
        assert!(validator.validate("http://169.254.169.254/").is_err());
        assert!(validator.validate("http://metadata.google.internal/").is_err());
    }

    #[test]
    fn test_blocks_non_http() {
        let validator = UrlValidator::new();
        assert!(validator.validate("file:///etc/passwd").is_err());
        assert!(validator.validate("ftp://example.com/").is_err());
    }

    #[test]
    fn test_allows_public_forum_urls() {
        let validator = UrlValidator::new();
        assert!(validator
            .validate("https://forums.phoenixrising.me/threads/topic.1")
            .is_ok());
        assert!(validator.allow_host("localhost").validate("http://localhost/").is_ok());
    }

    #[tokio::test]
    async fn test_validated_crawler_rejects_before_fetching() {
        let mock = std::sync::Arc::new(MockCrawler::new());
        let crawler = ValidatedCrawler::new(mock.clone()).without_dns();

        let err = crawler.fetch("http://10.1.2.3/admin").await.unwrap_err();
        assert!(matches!(err, CrawlError::Security(_)));
        assert!(mock.fetched_urls().is_empty());
    }

    #[tokio::test]
    async fn test_validated_crawler_checks_redirect_target() {
        let mock = std::sync::Arc::new(MockCrawler::new().with_page(
            "https://forum.example/t/1",
            crate::types::document::FetchedPage::new("http://127.0.0.1/t/1", "story"),
        ));
        let crawler = ValidatedCrawler::new(mock).without_dns();

        let err = crawler.fetch("https://forum.example/t/1").await.unwrap_err();
        assert!(matches!(err, CrawlError::Security(_)));
    }
}
