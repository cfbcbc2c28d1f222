//! Typed errors for the testimony pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling. Every per-item failure is
//! classified so the fetch pool and the extraction driver can decide
//! between retrying, recording and aborting.

use thiserror::Error;

/// How a failure should be handled by the stage that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff up to the configured ceiling.
    Transient,
    /// Record against the item and move on.
    Permanent,
    /// Abort the whole run.
    Fatal,
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Ledger operation failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Raw or record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A crawl failure classified as fatal (e.g. rejected credentials)
    #[error("crawl aborted: {0}")]
    Crawl(#[from] CrawlError),

    /// A reasoning failure classified as fatal
    #[error("reasoning aborted: {0}")]
    Reason(#[from] ReasonError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors raised by the document ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The entry is not in progress under the presented lease.
    #[error("lease conflict on {id}: {reason}")]
    Conflict { id: String, reason: String },

    /// No entry with this id exists.
    #[error("ledger entry not found: {id}")]
    NotFound { id: String },

    /// Underlying storage failed
    #[error("ledger storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Errors raised by the raw document store and the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document or record stored under this key
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Refused to store an empty body
    #[error("refusing to store empty body for {source_id}")]
    EmptyBody { source_id: String },

    /// Stored data could not be decoded
    #[error("corrupt entry at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while fetching a single document.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Security validation failed
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// HTTP request failed before a response was received
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Upstream asked us to slow down
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Invalid URL format
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Robots.txt disallows crawling
    #[error("robots.txt disallows: {url}")]
    RobotsDisallowed { url: String },

    /// Fetch did not complete in time
    #[error("timeout crawling: {url}")]
    Timeout { url: String },

    /// The document does not exist
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Upstream answered with an error status
    #[error("server error {status} for {url}")]
    Server { url: String, status: u16 },

    /// Credentials were rejected; continuing would fail every item
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The body was fetched but is not testimony (error page, login wall, ...)
    #[error("rejected content at {url}: {reason}")]
    RejectedContent { url: String, reason: String },
}

impl CrawlError {
    /// Classify this failure for the fetch pool.
    pub fn class(&self) -> FailureClass {
        match self {
            CrawlError::Unauthorized { .. } => FailureClass::Fatal,
            CrawlError::Http(_) | CrawlError::RateLimitExceeded | CrawlError::Timeout { .. } => {
                FailureClass::Transient
            }
            CrawlError::Server { status, .. } if *status >= 500 || *status == 429 => {
                FailureClass::Transient
            }
            CrawlError::Server { .. }
            | CrawlError::Security(_)
            | CrawlError::InvalidUrl { .. }
            | CrawlError::RobotsDisallowed { .. }
            | CrawlError::NotFound { .. }
            | CrawlError::RejectedContent { .. } => FailureClass::Permanent,
        }
    }

    /// Map a target page's HTTP status code to a typed crawl error.
    ///
    /// Rejected credentials for the crawl service itself are reported as
    /// [`CrawlError::Unauthorized`] by the client, not through this mapping.
    pub fn from_status(url: &str, status: u16) -> Self {
        match status {
            404 | 410 => CrawlError::NotFound {
                url: url.to_string(),
            },
            429 => CrawlError::RateLimitExceeded,
            _ => CrawlError::Server {
                url: url.to_string(),
                status,
            },
        }
    }
}

/// Security-related errors, primarily for SSRF protection.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// URL scheme not allowed (e.g., file://, ftp://)
    #[error("disallowed URL scheme: {0}")]
    DisallowedScheme(String),

    /// Host is blocked (e.g., localhost, internal IPs)
    #[error("blocked host: {0}")]
    BlockedHost(String),

    /// IP in blocked CIDR range (e.g., 10.0.0.0/8)
    #[error("blocked IP range: {0}")]
    BlockedCidr(String),

    /// URL has no host
    #[error("URL has no host")]
    NoHost,

    /// DNS resolution failed
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Failures reported by the reasoning capability.
#[derive(Debug, Error)]
pub enum ReasonError {
    /// The call did not complete in time
    #[error("reasoner timed out")]
    Timeout,

    /// Upstream asked us to slow down
    #[error("reasoner rate limited")]
    RateLimited,

    /// Transport or upstream server failure
    #[error("reasoner transport error: {0}")]
    Transport(String),

    /// The reply could not be parsed into the expected shape
    #[error("malformed reasoner reply: {0}")]
    Malformed(String),

    /// The reasoner declined to answer
    #[error("reasoner refused: {0}")]
    Refusal(String),

    /// Credentials were rejected
    #[error("reasoner unauthorized: {0}")]
    Unauthorized(String),
}

impl ReasonError {
    pub fn class(&self) -> FailureClass {
        match self {
            ReasonError::Timeout | ReasonError::RateLimited | ReasonError::Transport(_) => {
                FailureClass::Transient
            }
            ReasonError::Malformed(_) | ReasonError::Refusal(_) => FailureClass::Permanent,
            ReasonError::Unauthorized(_) => FailureClass::Fatal,
        }
    }
}

/// Invalid tuning parameters, detected before any work starts.
#[derive(Debug, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for crawl operations.
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

/// Result type alias for security operations.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

/// Result type alias for reasoning operations.
pub type ReasonResult<T> = std::result::Result<T, ReasonError>;
