use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::budget::{DEFAULT_CAPACITY, DEFAULT_MIN_INTERVAL};
use crate::cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS};
use crate::error::ConfigError;
use crate::feed::FeedOptions;
use crate::store::DEFAULT_STORE_FRESHNESS_SECS;
use crate::sync::SyncOptions;
use crate::upstream::UpstreamOptions;
use crate::upstream::auth::DEFAULT_TOKEN_TTL_SECS;

pub const DEFAULT_CONFIG_FILE: &str = "podmirror.toml";
const ENV_PREFIX: &str = "PODMIRROR_";

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub auth_url: String,
    pub api_key: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    pub token_ttl_secs: i64,
    pub batch_size: usize,
    pub completeness_ratio: f64,
    pub max_attempts: u32,
    pub rate_limit_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub min_interval_ms: u64,
    pub capacity: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: i64,
    pub store_fresh_secs: i64,
    /// Entries kept per cache before the least useful are evicted
    pub max_entries: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub author: String,
    pub owner_name: String,
    pub owner_email: String,
    pub category: String,
    pub explicit: bool,
}

fn default_loglevel() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            feed: FeedConfig::default(),
            loglevel: default_loglevel(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_url: String::new(),
            api_key: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 30,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            batch_size: 500,
            completeness_ratio: 0.9,
            max_attempts: 3,
            rate_limit_backoff_secs: 10,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: DEFAULT_MIN_INTERVAL.as_millis() as u64,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            store_fresh_secs: DEFAULT_STORE_FRESHNESS_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/".to_string(),
            author: String::new(),
            owner_name: String::new(),
            owner_email: String::new(),
            category: "Society & Culture".to_string(),
            explicit: false,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if it exists, then `PODMIRROR_*` variables.
    ///
    /// Nested keys use `__` in variable names, e.g. `PODMIRROR_UPSTREAM__API_KEY`.
    pub fn figment(path: Option<&Path>) -> Figment {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        let figment = if path.is_file() {
            figment.merge(Toml::file(path))
        } else {
            figment
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate the configuration
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("upstream.base_url", &self.upstream.base_url),
            ("upstream.auth_url", &self.upstream.auth_url),
            ("upstream.api_key", &self.upstream.api_key),
            ("upstream.username", &self.upstream.username),
            ("upstream.password", &self.upstream.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(field));
            }
        }

        parse_url("upstream.base_url", &self.upstream.base_url)?;
        parse_url("upstream.auth_url", &self.upstream.auth_url)?;
        parse_url("feed.base_url", &self.feed.base_url)?;

        let durations = [
            ("upstream.token_ttl_secs", self.upstream.token_ttl_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("cache.store_fresh_secs", self.cache.store_fresh_secs),
        ];
        for (field, secs) in durations {
            if secs < 0 || chrono::Duration::try_seconds(secs).is_none() {
                return Err(ConfigError::OutOfRange { field, value: secs });
            }
        }
        Ok(())
    }

    pub fn upstream_options(&self) -> Result<UpstreamOptions, ConfigError> {
        let upstream = &self.upstream;
        let mut options = UpstreamOptions::new(
            parse_url("upstream.base_url", &upstream.base_url)?,
            parse_url("upstream.auth_url", &upstream.auth_url)?,
        );
        options.api_key = upstream.api_key.clone();
        options.username = upstream.username.clone();
        options.password = upstream.password.clone();
        options.token_ttl = seconds(upstream.token_ttl_secs, DEFAULT_TOKEN_TTL_SECS);
        options.batch_size = upstream.batch_size.max(1);
        options.completeness_ratio = upstream.completeness_ratio.clamp(0.0, 1.0);
        options.max_attempts = upstream.max_attempts.max(1);
        options.rate_limit_backoff = Duration::from_secs(upstream.rate_limit_backoff_secs);
        Ok(options)
    }

    pub fn feed_options(&self) -> Result<FeedOptions, ConfigError> {
        let feed = &self.feed;
        let mut options = FeedOptions::new(parse_url("feed.base_url", &feed.base_url)?);
        options.author = feed.author.clone();
        options.owner_name = feed.owner_name.clone();
        options.owner_email = feed.owner_email.clone();
        options.category = feed.category.clone();
        options.explicit = feed.explicit;
        Ok(options)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            store_freshness: seconds(self.cache.store_fresh_secs, DEFAULT_STORE_FRESHNESS_SECS),
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        seconds(self.cache.ttl_secs, DEFAULT_TTL_SECS)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.budget.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }
}

/// `secs` as a duration, or `fallback_secs` when it does not fit one
fn seconds(secs: i64, fallback_secs: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs)
        .filter(|duration| *duration >= chrono::Duration::zero())
        .unwrap_or_else(|| chrono::Duration::seconds(fallback_secs))
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { field, source })
}
