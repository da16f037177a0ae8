use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::error::UpstreamError;

/// Default lifetime of a login token when the upstream does not say otherwise
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

/// A token fresh from the login endpoint
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    /// Lifetime announced by the upstream, if any
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Holds the current `(token, expires_at)` pair.
///
/// The lock is kept while refreshing so concurrent callers share one login.
pub struct AuthToken {
    ttl: Duration,
    clock: SharedClock,
    current: Mutex<Option<CachedToken>>,
}

impl AuthToken {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            current: Mutex::new(None),
        }
    }

    /// Return the cached token, calling `refresh` first if it is missing or expired
    pub async fn get<F, Fut>(&self, refresh: F) -> Result<String, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IssuedToken, UpstreamError>>,
    {
        let mut current = self.current.lock().await;

        if let Some(token) = current.as_ref()
            && self.clock.now() < token.expires_at
        {
            return Ok(token.value.clone());
        }

        let issued = refresh().await?;
        let now = self.clock.now();
        let expires_at = issued
            .expires_in
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .or_else(|| now.checked_add_signed(self.ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tracing::debug!(%expires_at, "Obtained upstream token");

        *current = Some(CachedToken {
            value: issued.value.clone(),
            expires_at,
        });
        Ok(issued.value)
    }

    /// Drop the cached token so the next `get` logs in again
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
