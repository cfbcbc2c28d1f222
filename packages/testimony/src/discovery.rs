//! Link discovery heuristics for forum crawling.
//!
//! - [`canonicalize_url`] - one ledger id per thread, however it was linked
//! - [`rank_links`] - which discovered links are worth fetching, best first
//! - [`inspect_content`] - whether a fetched body is testimony at all

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::types::source::SourceSeed;

/// Priority given to seed URLs, above any link score.
pub const SEED_PRIORITY: i64 = 100;

/// Score assigned to links that must never be fetched.
pub const DENIED_SCORE: i64 = -100;

/// Links scoring below this are dropped unless the seed says otherwise.
pub const DEFAULT_MIN_SCORE: i64 = 1;

/// Query parameters that identify a thread rather than a view of it.
const THREAD_PARAMS: &[&str] = &["f", "m", "t", "id", "tid", "topic", "threadid"];

/// Links to these are navigation, accounts or feeds.
const JUNK_TOKENS: &[&str] = &[
    "login",
    "logout",
    "register",
    "lost-password",
    "/members/",
    "/forums/",
    "/account/",
    "/search",
    "/tags/",
    "/whats-new",
    "/find-new",
    "/help/",
    "recaptcha",
    ".rss",
    "/feed",
    "mailto:",
];

/// Announcement and digest threads that look like stories but are not.
const HARD_DENY_TOKENS: &[&str] = &["news-in-brief", "newsletter", "announcement", "forum-rules"];

const THREAD_TOKENS: &[&str] = &["/threads/", "/topic", "/t/", "viewtopic", "showthread"];

const STORY_TOKENS: &[&str] = &[
    "story",
    "stories",
    "experience",
    "journey",
    "living-with",
    "my-",
    "diagnos",
    "recovery",
];

fn paging_suffix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/(?:page|post)-\d+$").unwrap())
}

/// Canonical form of a discovered URL, used as the ledger id.
///
/// Drops the fragment, userinfo and every query parameter except thread
/// identifiers, collapses forum `/page-N` and `/post-N` suffixes and strips
/// the trailing slash. Returns `None` for anything but absolute HTTP(S) URLs.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;

    let mut path = parsed.path().to_string();
    loop {
        let trimmed = path.trim_end_matches('/').len();
        path.truncate(trimmed);
        match paging_suffix().find(&path) {
            Some(m) => path.truncate(m.start()),
            None => break,
        }
    }

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| THREAD_PARAMS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut canonical = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        canonical.push_str(&format!(":{port}"));
    }
    canonical.push_str(&path);
    if !kept.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        canonical.push('?');
        canonical.push_str(&query);
    }
    Some(canonical)
}

fn bare_host(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

/// Whether `url` lives on the seed's host or one of its subdomains.
pub fn same_site(url: &str, seed_url: &str) -> bool {
    match (bare_host(url), bare_host(seed_url)) {
        (Some(host), Some(seed)) => host == seed || host.ends_with(&format!(".{seed}")),
        _ => false,
    }
}

/// Whether a link points at navigation rather than content.
pub fn is_junk_link(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    JUNK_TOKENS.iter().any(|t| lowered.contains(t))
}

/// Whether a link hits a hard-deny token, or a deny token of its seed.
pub fn is_denied_link(url: &str, seed: Option<&SourceSeed>) -> bool {
    let lowered = url.to_ascii_lowercase();
    HARD_DENY_TOKENS.iter().any(|t| lowered.contains(t))
        || seed.is_some_and(|seed| {
            seed.deny_tokens
                .iter()
                .any(|t| lowered.contains(&t.to_ascii_lowercase()))
        })
}

/// Score a canonical link for a seed. Higher is fetched first.
///
/// Denied links score [`DENIED_SCORE`]. Thread pages and story-like paths
/// earn points; links that miss every required token of the seed score 0.
pub fn score_link(url: &str, seed: &SourceSeed) -> i64 {
    let lowered = url.to_ascii_lowercase();

    if is_denied_link(&lowered, Some(seed)) || is_junk_link(&lowered) {
        return DENIED_SCORE;
    }

    if !seed.require_tokens.is_empty()
        && !seed
            .require_tokens
            .iter()
            .any(|t| lowered.contains(&t.to_ascii_lowercase()))
    {
        return 0;
    }

    let mut score = 0;
    if THREAD_TOKENS.iter().any(|t| lowered.contains(t)) || lowered.contains("&m=") {
        score += 10;
    }
    score += 5 * STORY_TOKENS.iter().filter(|t| lowered.contains(*t)).count() as i64;
    if !seed.require_tokens.is_empty() {
        score += 5;
    }
    score
}

/// A discovered link worth enqueueing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredLink {
    pub url: String,
    pub score: i64,
}

/// Canonicalize, filter and rank the links found on `page_url`.
///
/// Relative links are resolved against the page. Keeps same-site links
/// scoring at least the seed's minimum, without duplicates or the page
/// itself, best first, at most `cap`.
pub fn rank_links(links: &[String], page_url: &str, seed: &SourceSeed, cap: usize) -> Vec<ScoredLink> {
    let min_score = seed.min_score.unwrap_or(DEFAULT_MIN_SCORE);
    let own = canonicalize_url(page_url);
    let base = url::Url::parse(page_url).ok();
    let mut seen = HashSet::new();

    let mut ranked: Vec<ScoredLink> = links
        .iter()
        .filter_map(|link| match &base {
            Some(base) => base.join(link).ok().map(String::from),
            None => Some(link.clone()),
        })
        .filter_map(|link| canonicalize_url(&link))
        .filter(|url| Some(url) != own.as_ref())
        .filter(|url| same_site(url, &seed.url))
        .filter(|url| seen.insert(url.clone()))
        .map(|url| {
            let score = score_link(&url, seed);
            ScoredLink { url, score }
        })
        .filter(|link| link.score >= min_score)
        .collect();

    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.url.cmp(&b.url)));
    ranked.truncate(cap);
    ranked
}

/// What a fetched body turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentVerdict {
    /// Worth storing and extracting from
    Testimony,
    /// A thread listing: follow its links, do not store it
    Directory,
    /// Not content at all
    Rejected(String),
}

const ERROR_MARKERS: &[&str] = &[
    "oops! we ran into some problems",
    "the requested page could not be found",
    "the requested forum could not be found",
    "the requested thread could not be found",
    "404 not found",
];

const DIRECTORY_MARKERS: &[&str] = &["sort by", "topics in this forum", "threads", "messages"];

/// Bodies shorter than this are judged on weaker signals.
const SHORT_BODY: usize = 2_000;

fn looks_like_error_page(lowered: &str) -> bool {
    ERROR_MARKERS.iter().any(|m| lowered.contains(m))
        || (lowered.len() < SHORT_BODY && lowered.contains("could not be found"))
}

fn looks_like_auth_wall(lowered: &str) -> bool {
    lowered.contains("you must be logged-in")
        || lowered.contains("you must be logged in")
        || (lowered.len() < SHORT_BODY
            && lowered.contains("forgot your password")
            && lowered.contains("log in"))
}

fn looks_like_directory(lowered: &str, url: &str) -> bool {
    let lines: Vec<&str> = lowered
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return false;
    }

    let link_lines = lines
        .iter()
        .filter(|l| (l.starts_with("- [") || l.starts_with("* [")) && l.contains("]("))
        .count();
    let markers = DIRECTORY_MARKERS
        .iter()
        .filter(|m| lowered.contains(*m))
        .count();
    let ratio = link_lines as f64 / lines.len() as f64;

    (link_lines >= 50 && ratio >= 0.6 && markers >= 2)
        || (url.contains("/forums/") && link_lines >= 20 && markers >= 2)
}

/// Decide whether a fetched body is testimony.
pub fn inspect_content(url: &str, body: &str) -> ContentVerdict {
    if body.trim().is_empty() {
        return ContentVerdict::Rejected("empty body".to_string());
    }

    let lowered = body.to_lowercase();
    if looks_like_error_page(&lowered) {
        return ContentVerdict::Rejected("error page".to_string());
    }
    if looks_like_auth_wall(&lowered) {
        return ContentVerdict::Rejected("login wall".to_string());
    }
    if looks_like_directory(&lowered, url) {
        return ContentVerdict::Directory;
    }
    ContentVerdict::Testimony
}

fn status_401() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b401\b").unwrap())
}

/// Whether an upstream error message means our credentials were rejected.
pub fn is_auth_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("unauthorized")
        || lowered.contains("invalid api key")
        || status_401().is_match(&lowered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn s4me() -> SourceSeed {
        SourceSeed::new(
            "Science for ME - Patient Experiences",
            "https://www.s4me.info/forums/patient-experiences.16/",
        )
    }

    #[test]
    fn test_canonicalize_removes_tracking_query() {
        assert_eq!(
            canonicalize_url(
                "https://www.s4me.info/threads/a-story.123/?utm_source=x&utm_medium=y&page=2#fragment"
            )
            .as_deref(),
            Some("https://www.s4me.info/threads/a-story.123")
        );
    }

    #[test]
    fn test_canonicalize_collapses_pagination_and_post_links() {
        for url in [
            "https://forums.phoenixrising.me/threads/topic-name.12345/page-4",
            "https://forums.phoenixrising.me/threads/topic-name.12345/post-67890",
            "https://forums.phoenixrising.me/threads/topic-name.12345/page-2/",
        ] {
            assert_eq!(
                canonicalize_url(url).as_deref(),
                Some("https://forums.phoenixrising.me/threads/topic-name.12345")
            );
        }
    }

    #[test]
    fn test_canonicalize_keeps_thread_identifiers() {
        assert_eq!(
            canonicalize_url("https://www.healingwell.com/community/default.aspx?f=15&m=2039099&p=4")
                .as_deref(),
            Some("https://www.healingwell.com/community/default.aspx?f=15&m=2039099")
        );
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert_eq!(canonicalize_url("mailto:someone@example.org"), None);
        assert_eq!(canonicalize_url("/threads/relative.1"), None);
        assert_eq!(
            canonicalize_url("https://example.org/").as_deref(),
            Some("https://example.org")
        );
    }

    #[test]
    fn test_rank_prefers_story_pages_and_filters_low_signal() {
        let links: Vec<String> = [
            "https://www.s4me.info/login/",
            "https://www.s4me.info/members/user.1/",
            "https://www.s4me.info/forums/some-subforum.44/",
            "https://www.s4me.info/threads/my-me-cfs-story.555/",
            "https://www.s4me.info/threads/my-me-cfs-story.555/page-2",
            "https://elsewhere.example/threads/story.1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let ranked = rank_links(&links, &s4me().url, &s4me(), 50);
        assert_eq!(
            ranked.iter().map(|l| l.url.as_str()).collect::<Vec<_>>(),
            vec!["https://www.s4me.info/threads/my-me-cfs-story.555"]
        );
    }

    #[test]
    fn test_hard_deny_tokens_force_low_score() {
        assert_eq!(
            score_link(
                "https://www.s4me.info/threads/news-in-brief-february-2026.48741",
                &s4me()
            ),
            DENIED_SCORE
        );
        let seed = s4me().with_deny_tokens(&["covid-vaccine"]);
        assert_eq!(
            score_link("https://www.s4me.info/threads/covid-vaccine-story.9", &seed),
            DENIED_SCORE
        );
        assert!(is_denied_link("https://www.s4me.info/threads/Forum-Rules.1", None));
        assert!(!is_denied_link("https://www.s4me.info/threads/covid-vaccine-story.9", None));
    }

    #[test]
    fn test_rank_respects_required_tokens() {
        let seed = SourceSeed::new("Healthtalk.org - Long COVID", "https://healthtalk.org/long-covid")
            .with_require_tokens(&["long-covid"]);
        let links = vec![
            "https://healthtalk.org/experiences/alopecia/example-entry".to_string(),
            "https://healthtalk.org/long-covid/living-with-fatigue".to_string(),
        ];

        let ranked = rank_links(&links, &seed.url, &seed, 50);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].url, "https://healthtalk.org/long-covid/living-with-fatigue");
    }

    #[test]
    fn test_rank_caps_and_orders() {
        let links: Vec<String> = (0..10)
            .map(|i| format!("https://www.s4me.info/threads/topic.{i}"))
            .chain(std::iter::once(
                "https://www.s4me.info/threads/my-story.99".to_string(),
            ))
            .collect();

        let ranked = rank_links(&links, &s4me().url, &s4me(), 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].url, "https://www.s4me.info/threads/my-story.99");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_same_site_accepts_subdomains() {
        assert!(same_site("https://health.healingwell.com/x", "https://www.healingwell.com/"));
        assert!(!same_site("https://example.org/x", "https://www.healingwell.com/"));
    }

    #[test]
    fn test_detects_error_page() {
        let body = "# Oops! We ran into some problems.\nThe requested forum could not be found.\n";
        assert_eq!(
            inspect_content("https://a.example/x", body),
            ContentVerdict::Rejected("error page".to_string())
        );
    }

    #[test]
    fn test_detects_auth_wall() {
        let body = "# Log in\nYou must be logged-in to do that.\nForgot your password?\n";
        assert_eq!(
            inspect_content("https://a.example/x", body),
            ContentVerdict::Rejected("login wall".to_string())
        );
    }

    #[test]
    fn test_detects_directory_page() {
        let body = std::iter::repeat("- [New posts](https://example.org/new)")
            .take(70)
            .chain(["Sort by", "topics in this forum", "Threads 100", "Messages 500"])
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(
            inspect_content("https://forums.phoenixrising.me/forums/the-patients-story.4/", &body),
            ContentVerdict::Directory
        );
    }

    #[test]
    fn test_story_passes_inspection() {
        let body = "# Eleven years of ME/CFS\n\nI got sick in 2013 after a virus. \
                    The doctor said my results could not be found at first, but later...\n"
            .repeat(30);
        assert_eq!(inspect_content("https://a.example/t/1", &body), ContentVerdict::Testimony);
        assert_eq!(
            inspect_content("https://a.example/t/1", "  \n "),
            ContentVerdict::Rejected("empty body".to_string())
        );
    }

    #[test]
    fn test_auth_error_markers() {
        assert!(is_auth_error("Unauthorized: Invalid token"));
        assert!(is_auth_error("HTTP 401 from Firecrawl"));
        assert!(!is_auth_error("NameResolutionError"));
        assert!(!is_auth_error("HTTP 4010 something"));
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(
            url in r"https?://[a-z]{1,8}\.example(/[a-z0-9.\-]{1,8}){0,4}/?(\?[a-z]{1,2}=[a-z0-9]{0,3}(&[a-z]{1,2}=[a-z0-9]{0,3}){0,2})?(#[a-z]{0,4})?"
        ) {
            if let Some(once) = canonicalize_url(&url) {
                prop_assert_eq!(canonicalize_url(&once), Some(once.clone()));
            }
        }
    }
}
