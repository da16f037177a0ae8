use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when talking to the upstream catalog API
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream returned HTTP {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Upstream kept rate limiting {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("Upstream has no resource at {url}")]
    NotFound { url: String },

    #[error("Unexpected response shape from {url}: {source}")]
    Malformed {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Authentication failed: {reason}")]
    Auth { reason: String },
}

impl UpstreamError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Errors that can occur when reading or writing the persisted catalog
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse stored JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Podcast {0} is not in the store")]
    PodcastNotFound(String),

    #[error("Episode {0} is not in the store")]
    EpisodeNotFound(String),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("{0} must be set and non-empty")]
    Missing(&'static str),

    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("{field} is not a valid URL: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// Errors that can occur when rendering a feed document
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to write RSS document: {0}")]
    WriteFailed(#[from] rss::Error),

    #[error("Failed to write RDF document: {0}")]
    XmlFailed(#[from] xml::writer::Error),

    #[error("Rendered feed is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Top-level errors surfaced to callers of the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Upstream unavailable for {resource}: {source}")]
    ServiceUnavailable {
        resource: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Wrap an upstream failure, keeping not-found distinct from availability problems
    pub fn from_upstream(resource: &str, source: UpstreamError) -> Self {
        if source.is_not_found() {
            Self::NotFound(resource.to_string())
        } else {
            Self::ServiceUnavailable {
                resource: resource.to_string(),
                source,
            }
        }
    }
}
