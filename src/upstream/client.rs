// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use super::auth::{AuthToken, DEFAULT_TOKEN_TTL_SECS, IssuedToken};
use super::wire::{ApiEpisode, ApiPodcast, ItemEnvelope, ListEnvelope, LoginResponse, Page};
use crate::budget::CallBudget;
use crate::clock::SharedClock;
use crate::error::UpstreamError;
use crate::http::HttpClient;

/// Characters of an error body kept in `UpstreamError::Status`
const BODY_PREVIEW_CHARS: usize = 500;

/// Settings for talking to the upstream catalog
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Podcast API root, e.g. `https://api.example.com/podcast/v1/podcast`
    pub base_url: Url,
    pub auth_url: Url,
    pub api_key: String,
    pub username: String,
    pub password: String,
    pub token_ttl: chrono::Duration,
    /// Page size for full-episode-set fetches
    pub batch_size: usize,
    /// Fraction of the announced total a multi-page fetch must reach
    pub completeness_ratio: f64,
    /// Attempts per call while the upstream answers 429
    pub max_attempts: u32,
    pub rate_limit_backoff: Duration,
}

impl UpstreamOptions {
    pub fn new(base_url: Url, auth_url: Url) -> Self {
        Self {
            base_url,
            auth_url,
            api_key: String::new(),
            username: String::new(),
            password: String::new(),
            token_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            batch_size: 500,
            completeness_ratio: 0.9,
            max_attempts: 3,
            rate_limit_backoff: Duration::from_secs(10),
        }
    }
}

/// Authenticated, paced access to the upstream catalog
pub struct UpstreamClient<C: HttpClient> {
    http: C,
    options: UpstreamOptions,
    budget: Arc<CallBudget>,
    token: AuthToken,
}

impl<C: HttpClient> UpstreamClient<C> {
    pub fn new(
        http: C,
        options: UpstreamOptions,
        budget: Arc<CallBudget>,
        clock: SharedClock,
    ) -> Self {
        let token = AuthToken::new(options.token_ttl, clock);
        Self {
            http,
            options,
            budget,
            token,
        }
    }

    pub fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    /// One page of the podcast list
    pub async fn list_podcasts(
        &self,
        page: usize,
        hits: usize,
    ) -> Result<Page<ApiPodcast>, UpstreamError> {
        let url = self.endpoint(&[], &paging(page, hits));
        let envelope: ListEnvelope<ApiPodcast> = self.get_json(&url).await?;
        Ok(envelope.into_page())
    }

    /// One page of a podcast's episodes
    pub async fn list_episodes(
        &self,
        podcast_id: &str,
        page: usize,
        hits: usize,
    ) -> Result<Page<ApiEpisode>, UpstreamError> {
        let url = self.endpoint(&[podcast_id], &paging(page, hits));
        let envelope: ListEnvelope<ApiEpisode> = self.get_json(&url).await?;
        Ok(envelope.into_page())
    }

    /// Full record of a single episode
    pub async fn episode_detail(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<ApiEpisode, UpstreamError> {
        let url = self.endpoint(&[podcast_id, episode_id], &[]);
        let envelope: ItemEnvelope<ApiEpisode> = self.get_json(&url).await?;
        envelope.into_first().ok_or_else(|| UpstreamError::NotFound {
            url: url.to_string(),
        })
    }

    /// Full records for a set of episode ids, in whatever order the upstream returns
    pub async fn episodes_by_ids(&self, ids: &[String]) -> Result<Vec<ApiEpisode>, UpstreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint(&["episodes"], &[("ids", ids.join(","))]);
        let envelope: ListEnvelope<ApiEpisode> = self.get_json(&url).await?;
        Ok(envelope.into_page().items)
    }

    /// Cheap probe returning the most recent episode of each podcast
    pub async fn latest_episodes(&self) -> Result<Vec<ApiEpisode>, UpstreamError> {
        let url = self.endpoint(&["latest"], &[]);
        let envelope: ListEnvelope<ApiEpisode> = self.get_json(&url).await?;
        Ok(envelope.into_page().items)
    }

    /// Every podcast in the catalog, page by page
    pub async fn fetch_all_podcasts(&self) -> Result<Vec<ApiPodcast>, UpstreamError> {
        let hits = self.options.batch_size.max(1);
        let mut podcasts = Vec::new();
        let mut page = 1;

        loop {
            let batch = self.list_podcasts(page, hits).await?;
            let received = batch.items.len();
            podcasts.extend(batch.items);

            if received == 0 || podcasts.len() >= batch.total {
                break;
            }
            page += 1;
        }

        Ok(podcasts)
    }

    /// Fetch a podcast's complete episode set.
    ///
    /// Returns an empty list when the upstream has no episodes or when the
    /// pages add up to less than `completeness_ratio` of the announced total;
    /// a partial set is never handed back.
    pub async fn fetch_all_episodes(
        &self,
        podcast_id: &str,
    ) -> Result<Vec<ApiEpisode>, UpstreamError> {
        let total = self.list_episodes(podcast_id, 1, 1).await?.total;
        if total == 0 {
            return Ok(Vec::new());
        }

        let batch_size = self.options.batch_size.max(1);
        let episodes = if total <= batch_size {
            self.list_episodes(podcast_id, 1, total).await?.items
        } else {
            let pages = total.div_ceil(batch_size);
            let mut episodes = Vec::new();

            for page in 1..=pages {
                let batch = self.list_episodes(podcast_id, page, batch_size).await?;
                if batch.items.is_empty() {
                    tracing::warn!(podcast_id, page, pages, "Upstream returned an empty page");
                    break;
                }
                episodes.extend(batch.items);
            }
            episodes
        };

        let required = total as f64 * self.options.completeness_ratio;
        if (episodes.len() as f64) < required {
            tracing::warn!(
                podcast_id,
                received = episodes.len(),
                total,
                "Discarding incomplete episode fetch"
            );
            return Ok(Vec::new());
        }

        tracing::debug!(podcast_id, received = episodes.len(), total, "Fetched episode set");
        Ok(episodes)
    }

    /// Build `{base}/{segments...}/?{query}`
    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Url {
        let mut url = self.options.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments).push("");
        }
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        url
    }

    async fn authenticate(&self) -> Result<IssuedToken, UpstreamError> {
        self.budget.wait().await;
        tracing::info!(url = %self.options.auth_url, "Logging in to upstream");

        let url = &self.options.auth_url;
        let response = self
            .http
            .post_form(
                url,
                &[
                    ("username", self.options.username.as_str()),
                    ("password", self.options.password.as_str()),
                ],
            )
            .await
            .map_err(|e| UpstreamError::Transport {
                url: url.to_string(),
                source: e,
            })?;

        if !response.is_success() {
            return Err(UpstreamError::Auth {
                reason: format!("login returned HTTP {}", response.status),
            });
        }

        let login: LoginResponse =
            serde_json::from_slice(&response.body).map_err(|e| UpstreamError::Malformed {
                url: url.to_string(),
                source: e,
            })?;

        Ok(IssuedToken {
            value: login.token().to_string(),
            expires_in: login
                .expires_in
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::Duration::try_seconds),
        })
    }

    /// GET a JSON document through the call budget.
    ///
    /// 429 responses back off and retry up to `max_attempts`; an auth failure
    /// drops the token and retries once with a fresh login.
    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, UpstreamError> {
        let mut attempts = 0;
        let mut reauthenticated = false;

        loop {
            attempts += 1;
            let token = self.token.get(|| self.authenticate()).await?;
            self.budget.wait().await;

            let headers = [("Apikey", self.options.api_key.clone()), ("Token", token)];
            let response =
                self.http
                    .get(url, &headers)
                    .await
                    .map_err(|e| UpstreamError::Transport {
                        url: url.to_string(),
                        source: e,
                    })?;

            match response.status {
                200..=299 => {
                    return serde_json::from_slice(&response.body).map_err(|e| {
                        UpstreamError::Malformed {
                            url: url.to_string(),
                            source: e,
                        }
                    });
                }
                429 if attempts >= self.options.max_attempts => {
                    return Err(UpstreamError::RateLimited {
                        url: url.to_string(),
                        attempts,
                    });
                }
                429 => {
                    tracing::warn!(
                        url = %url,
                        attempt = attempts,
                        backoff = ?self.options.rate_limit_backoff,
                        "Rate limited by upstream, backing off"
                    );
                    tokio::time::sleep(self.options.rate_limit_backoff).await;
                }
                401 | 403 if !reauthenticated => {
                    tracing::info!(url = %url, status = response.status, "Token rejected, logging in again");
                    reauthenticated = true;
                    attempts -= 1;
                    self.token.invalidate().await;
                }
                404 => {
                    return Err(UpstreamError::NotFound {
                        url: url.to_string(),
                    });
                }
                status => {
                    return Err(UpstreamError::Status {
                        url: url.to_string(),
                        status,
                        body: response.body_preview(BODY_PREVIEW_CHARS),
                    });
                }
            }
        }
    }
}

fn paging(page: usize, hits: usize) -> [(&'static str, String); 2] {
    [("pg", page.to_string()), ("hits", hits.to_string())]
}
