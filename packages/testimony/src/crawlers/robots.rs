//! Robots.txt parser and a crawler wrapper that honours it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CrawlError, CrawlResult};
use crate::traits::crawler::Crawler;
use crate::types::document::FetchedPage;

/// User agent we identify as when matching robots.txt groups.
pub const USER_AGENT: &str = "testimony-crawler";

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    /// Rules per user-agent (lowercase)
    groups: HashMap<String, AgentRules>,

    /// Rules for `*`
    default_rules: AgentRules,
}

/// Rules for one user-agent group.
#[derive(Debug, Clone, Default)]
struct AgentRules {
    /// Path prefixes, `true` for Allow
    rules: Vec<(String, bool)>,
    crawl_delay: Option<f64>,
}

impl AgentRules {
    /// Longest matching prefix wins; Allow wins a tie.
    fn is_allowed(&self, path: &str) -> bool {
        self.rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, allow)| (prefix.len(), *allow))
            .map_or(true, |(_, allow)| *allow)
    }
}

impl RobotsTxt {
    /// Parse robots.txt content.
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut agents: Vec<String> = Vec::new();
        let mut rules = AgentRules::default();
        let mut in_rules = false;

        let flush = |robots: &mut Self, agents: &mut Vec<String>, rules: &mut AgentRules| {
            for agent in agents.drain(..) {
                if agent == "*" {
                    robots.default_rules = rules.clone();
                } else {
                    robots.groups.insert(agent, rules.clone());
                }
            }
            *rules = AgentRules::default();
        };

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group
                    if in_rules {
                        flush(&mut robots, &mut agents, &mut rules);
                        in_rules = false;
                    }
                    agents.push(value.to_ascii_lowercase());
                }
                "disallow" if !value.is_empty() => {
                    rules.rules.push((value.to_string(), false));
                    in_rules = true;
                }
                "allow" if !value.is_empty() => {
                    rules.rules.push((value.to_string(), true));
                    in_rules = true;
                }
                "disallow" | "allow" => in_rules = true,
                "crawl-delay" => {
                    rules.crawl_delay = value.parse::<f64>().ok().filter(|d| *d >= 0.0);
                    in_rules = true;
                }
                _ => {}
            }
        }
        flush(&mut robots, &mut agents, &mut rules);

        robots
    }

    fn rules_for(&self, user_agent: &str) -> &AgentRules {
        let agent = user_agent.to_ascii_lowercase();
        self.groups
            .get(&agent)
            .or_else(|| {
                self.groups
                    .iter()
                    .filter(|(name, _)| agent.contains(name.as_str()))
                    .max_by_key(|(name, _)| name.len())
                    .map(|(_, rules)| rules)
            })
            .unwrap_or(&self.default_rules)
    }

    /// Check if a path (with query) is allowed for a user-agent.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        self.rules_for(user_agent).is_allowed(path)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.rules_for(user_agent)
            .crawl_delay
            .map(Duration::from_secs_f64)
    }
}

/// Fetch and parse robots.txt for an origin.
///
/// A missing robots.txt (any non-success status) allows everything.
pub async fn fetch_robots_txt(
    client: &reqwest::Client,
    origin: &str,
) -> Result<RobotsTxt, reqwest::Error> {
    let url = format!("{}/robots.txt", origin.trim_end_matches('/'));
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Ok(RobotsTxt::default());
    }
    Ok(RobotsTxt::parse(&response.text().await?))
}

/// `scheme://host[:port]` of a URL.
fn origin_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// A crawler that refuses URLs robots.txt disallows.
///
/// Rules are fetched once per origin and cached for the crawler's lifetime.
/// An unreachable robots.txt allows everything.
pub struct RobotsCrawler<C: Crawler> {
    inner: C,
    client: reqwest::Client,
    user_agent: String,
    cache: RwLock<HashMap<String, Arc<RobotsTxt>>>,
}

impl<C: Crawler> RobotsCrawler<C> {
    pub fn new(crawler: C) -> Self {
        Self {
            inner: crawler,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            user_agent: USER_AGENT.to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Use known rules for an origin instead of fetching them.
    pub fn with_rules(self, origin: impl Into<String>, robots: RobotsTxt) -> Self {
        self.cache
            .write()
            .unwrap()
            .insert(origin.into(), Arc::new(robots));
        self
    }

    async fn rules(&self, origin: &str) -> Arc<RobotsTxt> {
        if let Some(robots) = self.cache.read().unwrap().get(origin) {
            return robots.clone();
        }

        let robots = match fetch_robots_txt(&self.client, origin).await {
            Ok(robots) => robots,
            Err(e) => {
                warn!(origin, error = %e, "Could not fetch robots.txt, allowing all");
                RobotsTxt::default()
            }
        };
        let robots = Arc::new(robots);
        self.cache
            .write()
            .unwrap()
            .insert(origin.to_string(), robots.clone());
        robots
    }
}

#[async_trait]
impl<C: Crawler> Crawler for RobotsCrawler<C> {
    async fn fetch(&self, url: &str) -> CrawlResult<FetchedPage> {
        let parsed = url::Url::parse(url).map_err(|_| CrawlError::InvalidUrl {
            url: url.to_string(),
        })?;
        let origin = origin_of(&parsed).ok_or_else(|| CrawlError::InvalidUrl {
            url: url.to_string(),
        })?;

        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        if !self.rules(&origin).await.is_allowed(&self.user_agent, &path) {
            debug!(url, "Disallowed by robots.txt");
            return Err(CrawlError::RobotsDisallowed {
                url: url.to_string(),
            });
        }

        self.inner.fetch(url).await
    }
}
