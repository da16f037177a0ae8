// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::Duration;

use crate::cache::{CacheLayer, DetailKey, Directory, EpisodePageKey, PageKey};
use crate::clock::SharedClock;
use crate::error::{SyncError, UpstreamError};
use crate::http::HttpClient;
use crate::model::{DescriptionSource, Episode, Podcast, PodcastFields};
use crate::store::{DEFAULT_STORE_FRESHNESS_SECS, Store};
use crate::upstream::{ApiEpisode, ApiPodcast, Page, UpstreamClient};

/// Options for podcast synchronization
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How long a refreshed podcast is served from the store alone
    pub store_freshness: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            store_freshness: Duration::seconds(DEFAULT_STORE_FRESHNESS_SECS),
        }
    }
}

/// A podcast with its episodes, newest first, as currently stored
#[derive(Debug, Clone)]
pub struct PodcastEpisodes {
    pub podcast: Podcast,
    pub episodes: Vec<Episode>,
    /// Upstream was consulted and the store updated for this request
    pub refreshed: bool,
    /// A refresh was needed but failed, so older stored data is served
    pub served_stale: bool,
}

/// Result of a description backfill pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Episodes whose description was replaced by the detail text
    pub verified: usize,
    /// Episodes whose detail fetch failed; they are marked verified anyway
    pub fetch_failed: usize,
    /// Ids that were listed as unverified but could not be loaded from the store
    pub missing: usize,
    /// Episodes whose store read or write failed; they stay unverified
    pub store_failed: usize,
}

/// Lowest title similarity a search accepts
pub const SEARCH_CUTOFF: f64 = 0.2;

/// Size of the podcast list page a search looks through
const SEARCH_HITS: usize = 500;

/// Closest podcast to a search query, with its newest upstream episode
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub podcast_id: String,
    pub podcast_title: String,
    /// Title similarity in `0.0..=1.0`
    pub score: f64,
    pub episode_title: Option<String>,
    pub episode_url: Option<String>,
}

/// Orchestrates freshness decisions between the caches, the store and upstream
pub struct SyncEngine<C: HttpClient, S: Store> {
    upstream: UpstreamClient<C>,
    store: S,
    cache: CacheLayer,
    options: SyncOptions,
    clock: SharedClock,
}

impl<C: HttpClient, S: Store> SyncEngine<C, S> {
    pub fn new(
        upstream: UpstreamClient<C>,
        store: S,
        cache: CacheLayer,
        options: SyncOptions,
        clock: SharedClock,
    ) -> Self {
        Self {
            upstream,
            store,
            cache,
            options,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Episodes of a podcast, refreshed from upstream when the store is stale.
    ///
    /// A fresh podcast is answered from the store without any upstream call.
    /// When a refresh fails and the store already holds episodes, those are
    /// returned with `served_stale` set; on a first sync the error is returned.
    pub async fn podcast_episodes(&self, podcast_id: &str) -> Result<PodcastEpisodes, SyncError> {
        let now = self.clock.now();
        let (stored, stale) = self
            .store
            .get_episodes(podcast_id, now, self.options.store_freshness)
            .await?;

        if !stale {
            let podcast = self
                .store
                .get_podcast(podcast_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("podcast {podcast_id}")))?;
            tracing::debug!(podcast_id, episodes = stored.len(), "Serving fresh episodes from store");
            return Ok(PodcastEpisodes {
                podcast,
                episodes: stored,
                refreshed: false,
                served_stale: false,
            });
        }

        match self.refresh_podcast(podcast_id).await {
            Ok(result) => Ok(result),
            Err(SyncError::ServiceUnavailable { resource, source }) if !stored.is_empty() => {
                tracing::warn!(
                    podcast_id,
                    error = %source,
                    episodes = stored.len(),
                    "Refresh failed, serving stored episodes"
                );
                match self.store.get_podcast(podcast_id).await? {
                    Some(podcast) => Ok(PodcastEpisodes {
                        podcast,
                        episodes: stored,
                        refreshed: false,
                        served_stale: true,
                    }),
                    None => Err(SyncError::ServiceUnavailable { resource, source }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the complete episode set and merge it into the store.
    ///
    /// The returned episodes are re-read from the store after the merge.
    pub async fn refresh_podcast(&self, podcast_id: &str) -> Result<PodcastEpisodes, SyncError> {
        let resource = format!("podcast {podcast_id}");
        tracing::info!(podcast_id, "Refreshing episodes from upstream");

        let fetched = self
            .upstream
            .fetch_all_episodes(podcast_id)
            .await
            .map_err(|e| SyncError::from_upstream(&resource, e))?;

        if fetched.is_empty() {
            return match self.store.get_podcast(podcast_id).await? {
                Some(podcast) => {
                    tracing::warn!(podcast_id, "No usable episode set upstream, keeping stored data");
                    let episodes = self.store.episodes_of(podcast_id).await?;
                    Ok(PodcastEpisodes {
                        podcast,
                        episodes,
                        refreshed: false,
                        served_stale: true,
                    })
                }
                None => Err(SyncError::NotFound(resource)),
            };
        }

        self.ensure_podcast(podcast_id, fetched.iter().find_map(|e| e.parent.as_ref()), true)
            .await?;

        let batch = fetched
            .iter()
            .map(|episode| episode.to_upsert(DescriptionSource::Authoritative))
            .collect();
        let report = self.store.upsert_episodes(podcast_id, batch).await;
        if !report.failures.is_empty() {
            tracing::warn!(
                podcast_id,
                written = report.written,
                failed = report.failures.len(),
                "Some episodes were not persisted"
            );
        }

        let now = self.clock.now();
        if let Err(e) = self.store.touch_last_checked(podcast_id, now).await {
            tracing::warn!(podcast_id, error = %e, "Failed to record refresh time");
        }
        self.cache.forget_episode_pages(podcast_id);

        let backfill = self.backfill_descriptions(podcast_id).await?;
        if backfill != BackfillReport::default() {
            tracing::info!(podcast_id, ?backfill, "Backfilled descriptions");
        }

        let podcast = self
            .store
            .get_podcast(podcast_id)
            .await?
            .ok_or(SyncError::NotFound(resource))?;
        let episodes = self.store.episodes_of(podcast_id).await?;
        tracing::info!(podcast_id, episodes = episodes.len(), written = report.written, "Refresh complete");

        Ok(PodcastEpisodes {
            podcast,
            episodes,
            refreshed: true,
            served_stale: false,
        })
    }

    /// Replace summary descriptions with detail text, one episode at a time.
    ///
    /// An episode whose detail fetch fails is still marked verified so it is
    /// not retried on every sync.
    pub async fn backfill_descriptions(&self, podcast_id: &str) -> Result<BackfillReport, SyncError> {
        let pending = self.store.unverified_episode_ids(podcast_id).await?;
        let mut report = BackfillReport::default();

        for episode_id in pending {
            match self.store.get_episode_by_external_id(&episode_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(podcast_id, episode_id = %episode_id, "Unverified episode vanished from store");
                    report.missing += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(podcast_id, episode_id = %episode_id, error = %e, "Failed to load episode for backfill");
                    report.store_failed += 1;
                    continue;
                }
            }

            let description = match self.fetch_detail(podcast_id, &episode_id).await {
                Ok(detail) => {
                    report.verified += 1;
                    Some(detail.best_description())
                }
                Err(e) => {
                    tracing::warn!(
                        podcast_id,
                        episode_id = %episode_id,
                        error = %e,
                        "Detail fetch failed, keeping summary text"
                    );
                    report.fetch_failed += 1;
                    None
                }
            };

            // Only the description fields change; a refresh may have updated the rest meanwhile
            if let Err(e) = self
                .store
                .mark_description_verified(&episode_id, description)
                .await
            {
                tracing::warn!(podcast_id, episode_id = %episode_id, error = %e, "Failed to persist backfilled episode");
                report.store_failed += 1;
            }
        }

        Ok(report)
    }

    /// One page of the podcast list, cached for the cache TTL
    pub async fn podcasts(&self, page: usize, hits: usize) -> Result<Page<ApiPodcast>, SyncError> {
        let key = PageKey { page, hits };
        if let Some(cached) = self.cache.podcasts.get(&key) {
            tracing::debug!(page, hits, "Podcast list cache hit");
            return Ok(cached);
        }

        tracing::debug!(page, hits, "Podcast list cache miss");
        let fetched = self
            .upstream
            .list_podcasts(page, hits)
            .await
            .map_err(|e| SyncError::from_upstream("podcast list", e))?;
        self.cache.podcasts.put(key, fetched.clone());
        Ok(fetched)
    }

    /// One page of a podcast's upstream episode listing, cached for the cache TTL
    pub async fn episode_page(
        &self,
        podcast_id: &str,
        page: usize,
        hits: usize,
    ) -> Result<Page<ApiEpisode>, SyncError> {
        let key = EpisodePageKey {
            podcast_id: podcast_id.to_string(),
            page,
            hits,
        };
        if let Some(cached) = self.cache.episodes.get(&key) {
            tracing::debug!(podcast_id, page, hits, "Episode page cache hit");
            return Ok(cached);
        }

        let fetched = self
            .upstream
            .list_episodes(podcast_id, page, hits)
            .await
            .map_err(|e| SyncError::from_upstream(&format!("podcast {podcast_id}"), e))?;
        self.cache.episodes.put(key, fetched.clone());
        Ok(fetched)
    }

    /// Full record of one episode.
    ///
    /// The detail text is authoritative, so a stored row for the episode is
    /// updated and verified along the way.
    pub async fn episode_detail(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<ApiEpisode, SyncError> {
        let detail = self
            .fetch_detail(podcast_id, episode_id)
            .await
            .map_err(|e| SyncError::from_upstream(&format!("episode {episode_id}"), e))?;

        if self.store.get_podcast(podcast_id).await?.is_some()
            && let Err(e) = self
                .store
                .upsert_episode(podcast_id, detail.to_upsert(DescriptionSource::Authoritative))
                .await
        {
            tracing::warn!(podcast_id, episode_id = %episode_id, error = %e, "Failed to persist episode detail");
        }

        Ok(detail)
    }

    /// Fuzzy-match `query` against podcast titles and return the best match.
    ///
    /// Both the podcast list and the newest-episode lookup go through the
    /// cached read paths.
    pub async fn search(&self, query: &str) -> Result<SearchHit, SyncError> {
        let query = query.trim().to_lowercase();
        let not_found = || SyncError::NotFound(format!("podcast matching \"{query}\""));
        if query.is_empty() {
            return Err(not_found());
        }

        let listing = self.podcasts(1, SEARCH_HITS).await?;
        let mut best: Option<(f64, &ApiPodcast)> = None;
        for podcast in &listing.items {
            let score = strsim::sorensen_dice(&query, &podcast.title.to_lowercase());
            if score >= SEARCH_CUTOFF && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, podcast));
            }
        }
        let Some((score, podcast)) = best else {
            tracing::debug!(query = %query, candidates = listing.items.len(), "No podcast matched");
            return Err(not_found());
        };

        let newest = self.episode_page(&podcast.id, 1, 1).await?.items.into_iter().next();
        tracing::debug!(query = %query, podcast_id = %podcast.id, score, "Search matched");

        Ok(SearchHit {
            podcast_id: podcast.id.clone(),
            podcast_title: podcast.title.clone(),
            score,
            episode_title: newest.as_ref().map(|episode| episode.title.clone()),
            episode_url: newest.map(|episode| episode.episode_raw_url),
        })
    }

    /// The podcast directory with each podcast's latest episode.
    ///
    /// Built in full only when nothing is cached; afterwards an expired
    /// directory is patched from the latest-episode probe. If the probe fails
    /// the previous directory is served.
    pub async fn directory(&self) -> Result<Directory, SyncError> {
        let now = self.clock.now();

        let Some(mut directory) = self.cache.directory() else {
            tracing::info!("Building podcast directory");
            let podcasts = self
                .upstream
                .fetch_all_podcasts()
                .await
                .map_err(|e| SyncError::from_upstream("directory", e))?;
            let latest = self
                .upstream
                .latest_episodes()
                .await
                .map_err(|e| SyncError::from_upstream("directory", e))?;

            let directory = Directory::build(&podcasts, &latest, now);
            self.record_summaries(&latest).await;
            self.cache.store_directory(directory.clone());
            return Ok(directory);
        };

        if directory.is_current(now, self.cache.ttl()) {
            tracing::debug!("Directory cache hit");
            return Ok(directory);
        }

        match self.upstream.latest_episodes().await {
            Ok(latest) => {
                let patched = directory.patch(&latest, now);
                tracing::info!(patched = patched.len(), "Patched podcast directory");
                for podcast_id in &patched {
                    self.cache.forget_episode_pages(podcast_id);
                }
                self.record_summaries(&latest).await;
                self.cache.store_directory(directory.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Latest-episode probe failed, serving previous directory");
            }
        }

        Ok(directory)
    }

    /// Fetch episodes by id and merge those whose podcast is already stored
    pub async fn lookup_episodes(&self, ids: &[String]) -> Result<Vec<Episode>, SyncError> {
        let fetched = self
            .upstream
            .episodes_by_ids(ids)
            .await
            .map_err(|e| SyncError::from_upstream("episode batch", e))?;

        let mut stored = Vec::with_capacity(fetched.len());
        for episode in fetched {
            let Some(podcast_id) = episode.parent_id() else {
                tracing::debug!(episode_id = %episode.id, "Episode without parent, skipping");
                continue;
            };
            if self.store.get_podcast(podcast_id).await?.is_none() {
                tracing::debug!(podcast_id, episode_id = %episode.id, "Podcast not stored, skipping");
                continue;
            }

            match self
                .store
                .upsert_episode(podcast_id, episode.to_upsert(DescriptionSource::Authoritative))
                .await
            {
                Ok(row) => stored.push(row),
                Err(e) => {
                    tracing::warn!(podcast_id, episode_id = %episode.id, error = %e, "Failed to persist episode");
                }
            }
        }

        Ok(stored)
    }

    async fn fetch_detail(
        &self,
        podcast_id: &str,
        episode_id: &str,
    ) -> Result<ApiEpisode, UpstreamError> {
        let key = DetailKey {
            podcast_id: podcast_id.to_string(),
            episode_id: episode_id.to_string(),
        };
        if let Some(cached) = self.cache.details.get(&key) {
            return Ok(cached);
        }

        let detail = self.upstream.episode_detail(podcast_id, episode_id).await?;
        self.cache.details.put(key, detail.clone());
        Ok(detail)
    }

    /// Create the podcast row if needed; `overwrite` refreshes an existing row's fields
    async fn ensure_podcast(
        &self,
        podcast_id: &str,
        parent: Option<&ApiPodcast>,
        overwrite: bool,
    ) -> Result<Podcast, SyncError> {
        let existing = self.store.get_podcast(podcast_id).await?;

        let podcast = match (existing, parent) {
            (Some(podcast), Some(parent)) if overwrite && podcast_fields(&podcast) != parent.fields() => {
                self.store.upsert_podcast(podcast_id, parent.fields()).await?
            }
            (Some(podcast), _) => podcast,
            (None, Some(parent)) => self.store.upsert_podcast(podcast_id, parent.fields()).await?,
            (None, None) => {
                let fields = PodcastFields {
                    title: podcast_id.to_string(),
                    description: String::new(),
                    image_url: String::new(),
                };
                self.store.upsert_podcast(podcast_id, fields).await?
            }
        };

        Ok(podcast)
    }

    /// Record probed episodes as summary rows awaiting backfill.
    ///
    /// Rows already in the store keep their verified description.
    async fn record_summaries(&self, latest: &[ApiEpisode]) {
        for episode in latest {
            let Some(parent) = &episode.parent else {
                continue;
            };

            if let Err(e) = self.ensure_podcast(&parent.id, Some(parent), false).await {
                tracing::warn!(podcast_id = %parent.id, error = %e, "Failed to record podcast from probe");
                continue;
            }
            if let Err(e) = self
                .store
                .upsert_episode(&parent.id, episode.to_upsert(DescriptionSource::Summary))
                .await
            {
                tracing::warn!(
                    podcast_id = %parent.id,
                    episode_id = %episode.id,
                    error = %e,
                    "Failed to record probed episode"
                );
            }
        }
    }
}

fn podcast_fields(podcast: &Podcast) -> PodcastFields {
    PodcastFields {
        title: podcast.title.clone(),
        description: podcast.description.clone(),
        image_url: podcast.image_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::model::EpisodeUpsert;
    use crate::store::MemoryStore;
    use crate::upstream::fake::{FakeApi, fake_client};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn engine_with<S: Store>(api: &FakeApi, store: S) -> (SyncEngine<FakeApi, S>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = SyncEngine::new(
            fake_client(api.clone()),
            store,
            CacheLayer::with_default_ttl(clock.clone()),
            SyncOptions::default(),
            clock.clone(),
        );
        (engine, clock)
    }

    fn engine(api: &FakeApi) -> (SyncEngine<FakeApi, MemoryStore>, Arc<ManualClock>) {
        engine_with(api, MemoryStore::new())
    }

    fn api_with_podcast(episodes: usize) -> FakeApi {
        let api = FakeApi::new();
        api.add_podcast("7", "Sette");
        api.add_episodes("7", episodes);
        api
    }

    fn summary(id: &str) -> EpisodeUpsert {
        EpisodeUpsert {
            external_id: id.to_string(),
            title: format!("Episode {id}"),
            description: "short".to_string(),
            description_source: DescriptionSource::Summary,
            audio_url: format!("https://cdn.example.com/{id}.mp3"),
            publication_date: None,
            duration_seconds: None,
        }
    }

    #[tokio::test]
    async fn first_sync_persists_verified_episodes() {
        let api = api_with_podcast(3);
        let (engine, _clock) = engine(&api);

        let result = engine.podcast_episodes("7").await.unwrap();

        assert!(result.refreshed);
        assert!(!result.served_stale);
        assert_eq!(result.podcast.title, "Sette");
        assert_eq!(result.podcast.last_checked_at, Some(start()));
        let ids: Vec<_> = result.episodes.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["7-3", "7-2", "7-1"]);
        assert!(result.episodes.iter().all(|e| e.description_verified));
        assert_eq!(result.episodes[0].description, "<p>Full text of 7-3</p>");
        assert_eq!(result.episodes[0].duration_seconds, Some(125));
    }

    #[tokio::test]
    async fn fresh_podcast_is_served_without_upstream() {
        let api = api_with_podcast(3);
        let (engine, clock) = engine(&api);

        engine.podcast_episodes("7").await.unwrap();
        let calls = api.get_count();

        clock.advance(Duration::minutes(59));
        let result = engine.podcast_episodes("7").await.unwrap();

        assert!(!result.refreshed);
        assert_eq!(result.episodes.len(), 3);
        assert_eq!(api.get_count(), calls);
    }

    #[tokio::test]
    async fn stale_podcast_is_refreshed_after_an_hour() {
        let api = api_with_podcast(3);
        let (engine, clock) = engine(&api);

        engine.podcast_episodes("7").await.unwrap();
        api.add_episodes("7", 1);
        clock.advance(Duration::minutes(61));

        let result = engine.podcast_episodes("7").await.unwrap();
        assert!(result.refreshed);
        assert_eq!(result.episodes.len(), 4);
        assert_eq!(result.episodes[0].external_id, "7-4");
        assert_eq!(result.podcast.last_checked_at, Some(start() + Duration::minutes(61)));
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let api = api_with_podcast(5);
        let (engine, clock) = engine(&api);

        engine.refresh_podcast("7").await.unwrap();
        let first = engine.store().episodes_of("7").await.unwrap();

        clock.advance(Duration::hours(2));
        engine.refresh_podcast("7").await.unwrap();
        let second = engine.store().episodes_of("7").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.store().list_podcasts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_fields_update_rows_in_place() {
        let api = api_with_podcast(2);
        let (engine, _clock) = engine(&api);

        engine.refresh_podcast("7").await.unwrap();
        api.rename_episode("7-1", "Renamed");
        engine.refresh_podcast("7").await.unwrap();

        let episodes = engine.store().episodes_of("7").await.unwrap();
        assert_eq!(episodes.len(), 2);
        let renamed = engine.store().get_episode_by_external_id("7-1").await.unwrap().unwrap();
        assert_eq!(renamed.title, "Renamed");
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_stored_episodes() {
        let api = api_with_podcast(3);
        let (engine, clock) = engine(&api);

        engine.podcast_episodes("7").await.unwrap();
        clock.advance(Duration::hours(2));
        api.fail_with(Some(503));

        let result = engine.podcast_episodes("7").await.unwrap();
        assert!(result.served_stale);
        assert!(!result.refreshed);
        assert_eq!(result.episodes.len(), 3);
    }

    #[tokio::test]
    async fn first_sync_failure_is_terminal() {
        let api = api_with_podcast(3);
        api.fail_with(Some(503));
        let (engine, _clock) = engine(&api);

        let result = engine.podcast_episodes("7").await;
        assert!(matches!(result, Err(SyncError::ServiceUnavailable { .. })));
    }

    #[tokio::test]
    async fn unknown_podcast_is_not_found() {
        let api = FakeApi::new();
        let (engine, _clock) = engine(&api);

        let result = engine.podcast_episodes("404").await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn incomplete_fetch_keeps_previous_episode_set() {
        let api = api_with_podcast(3);
        let (engine, clock) = engine(&api);
        engine.podcast_episodes("7").await.unwrap();

        // Announce far more than is served so the completeness gate trips
        api.announce_total("7", 1200);
        api.add_episodes("7", 10);
        clock.advance(Duration::hours(2));

        let result = engine.podcast_episodes("7").await.unwrap();
        assert!(result.served_stale);
        assert_eq!(result.episodes.len(), 3);
        // Not stamped, so the next request tries again
        assert_eq!(result.podcast.last_checked_at, Some(start()));
    }

    #[tokio::test]
    async fn backfill_verifies_and_tolerates_missing_detail() {
        let api = api_with_podcast(2);
        let (engine, _clock) = engine(&api);
        let store = engine.store();
        store
            .upsert_podcast(
                "7",
                PodcastFields {
                    title: "Sette".to_string(),
                    description: String::new(),
                    image_url: String::new(),
                },
            )
            .await
            .unwrap();
        store.upsert_episode("7", summary("7-1")).await.unwrap();
        store.upsert_episode("7", summary("7-99")).await.unwrap();

        let report = engine.backfill_descriptions("7").await.unwrap();

        assert_eq!(
            report,
            BackfillReport {
                verified: 1,
                fetch_failed: 1,
                missing: 0,
                store_failed: 0,
            }
        );
        let fetched = store.get_episode_by_external_id("7-1").await.unwrap().unwrap();
        assert!(fetched.description_verified);
        assert_eq!(fetched.description, "<p>Full text of 7-1</p>");

        let failed = store.get_episode_by_external_id("7-99").await.unwrap().unwrap();
        assert!(failed.description_verified);
        assert_eq!(failed.description, "short");

        // Nothing left to do, and no further detail calls
        let calls = api.get_count();
        let again = engine.backfill_descriptions("7").await.unwrap();
        assert_eq!(again, BackfillReport::default());
        assert_eq!(api.get_count(), calls);
    }

    #[tokio::test]
    async fn verified_flag_survives_later_syncs() {
        let api = api_with_podcast(2);
        let (engine, clock) = engine(&api);
        engine.directory().await.unwrap();
        assert!(
            !engine
                .store()
                .get_episode_by_external_id("7-2")
                .await
                .unwrap()
                .unwrap()
                .description_verified
        );

        engine.backfill_descriptions("7").await.unwrap();
        clock.advance(Duration::hours(2));
        // Another probe sees the same summary row again
        engine.cache().store_directory(Directory::build(&[], &[], start()));
        engine.directory().await.unwrap();

        let episode = engine.store().get_episode_by_external_id("7-2").await.unwrap().unwrap();
        assert!(episode.description_verified);
        assert_eq!(episode.description, "<p>Full text of 7-2</p>");
    }

    /// Wraps a memory store; refuses writes to one episode id and can rename
    /// an episode right after it was loaded, the way a concurrent refresh would
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        poisoned: Option<String>,
        rename_after_load: Option<String>,
    }

    #[async_trait]
    impl Store for ScriptedStore {
        async fn get_podcast(&self, id: &str) -> Result<Option<Podcast>, StoreError> {
            self.inner.get_podcast(id).await
        }

        async fn list_podcasts(&self) -> Result<Vec<Podcast>, StoreError> {
            self.inner.list_podcasts().await
        }

        async fn upsert_podcast(&self, id: &str, fields: PodcastFields) -> Result<Podcast, StoreError> {
            self.inner.upsert_podcast(id, fields).await
        }

        async fn episodes_of(&self, podcast_id: &str) -> Result<Vec<Episode>, StoreError> {
            self.inner.episodes_of(podcast_id).await
        }

        async fn upsert_episode(
            &self,
            podcast_id: &str,
            upsert: EpisodeUpsert,
        ) -> Result<Episode, StoreError> {
            if self.poisoned.as_deref() == Some(upsert.external_id.as_str()) {
                return Err(StoreError::EpisodeNotFound(upsert.external_id));
            }
            self.inner.upsert_episode(podcast_id, upsert).await
        }

        async fn mark_description_verified(
            &self,
            external_id: &str,
            description: Option<String>,
        ) -> Result<Episode, StoreError> {
            self.inner
                .mark_description_verified(external_id, description)
                .await
        }

        async fn get_episode_by_external_id(&self, id: &str) -> Result<Option<Episode>, StoreError> {
            let loaded = self.inner.get_episode_by_external_id(id).await?;

            if self.rename_after_load.as_deref() == Some(id)
                && let Some(episode) = &loaded
            {
                let renamed = EpisodeUpsert {
                    external_id: episode.external_id.clone(),
                    title: "Renamed".to_string(),
                    description: episode.description.clone(),
                    description_source: DescriptionSource::Summary,
                    audio_url: "https://cdn.example.com/renamed.mp3".to_string(),
                    publication_date: episode.publication_date,
                    duration_seconds: episode.duration_seconds,
                };
                self.inner.upsert_episode(&episode.podcast_id, renamed).await?;
            }

            Ok(loaded)
        }

        async fn touch_last_checked(
            &self,
            podcast_id: &str,
            at: DateTime<Utc>,
        ) -> Result<Podcast, StoreError> {
            self.inner.touch_last_checked(podcast_id, at).await
        }

        async fn delete_podcast(&self, podcast_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_podcast(podcast_id).await
        }
    }

    #[tokio::test]
    async fn one_failed_write_does_not_abort_the_sync() {
        let api = api_with_podcast(4);
        let store = ScriptedStore {
            poisoned: Some("7-2".to_string()),
            ..Default::default()
        };
        let (engine, _clock) = engine_with(&api, store);

        let result = engine.podcast_episodes("7").await.unwrap();

        let ids: Vec<_> = result.episodes.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["7-4", "7-3", "7-1"]);
    }

    #[tokio::test]
    async fn backfill_keeps_fields_updated_while_detail_was_fetched() {
        let api = api_with_podcast(1);
        let store = ScriptedStore {
            rename_after_load: Some("7-1".to_string()),
            ..Default::default()
        };
        store
            .upsert_podcast(
                "7",
                PodcastFields {
                    title: "Sette".to_string(),
                    description: String::new(),
                    image_url: String::new(),
                },
            )
            .await
            .unwrap();
        store.upsert_episode("7", summary("7-1")).await.unwrap();
        let (engine, _clock) = engine_with(&api, store);

        let report = engine.backfill_descriptions("7").await.unwrap();
        assert_eq!(report.verified, 1);

        let episode = engine.store().get_episode_by_external_id("7-1").await.unwrap().unwrap();
        assert_eq!(episode.title, "Renamed");
        assert_eq!(episode.audio_url, "https://cdn.example.com/renamed.mp3");
        assert_eq!(episode.description, "<p>Full text of 7-1</p>");
        assert!(episode.description_verified);
    }

    #[tokio::test]
    async fn podcast_list_is_cached_for_the_ttl() {
        let api = FakeApi::new();
        api.add_podcast("1", "Uno");
        let (engine, clock) = engine(&api);

        engine.podcasts(1, 20).await.unwrap();
        clock.advance(Duration::seconds(899));
        engine.podcasts(1, 20).await.unwrap();
        assert_eq!(api.get_count(), 1);

        clock.advance(Duration::seconds(2));
        let page = engine.podcasts(1, 20).await.unwrap();
        assert_eq!(api.get_count(), 2);
        assert_eq!(page.items[0].title, "Uno");
    }

    #[tokio::test]
    async fn episode_pages_are_cached_per_paging() {
        let api = api_with_podcast(5);
        let (engine, _clock) = engine(&api);

        let first = engine.episode_page("7", 1, 2).await.unwrap();
        engine.episode_page("7", 1, 2).await.unwrap();
        let second = engine.episode_page("7", 2, 2).await.unwrap();

        assert_eq!(api.get_count(), 2);
        assert_eq!(first.total, 5);
        assert_eq!(first.items[0].id, "7-5");
        assert_eq!(second.items[0].id, "7-3");
    }

    #[tokio::test]
    async fn episode_detail_is_cached() {
        let api = api_with_podcast(2);
        let (engine, _clock) = engine(&api);
        engine.refresh_podcast("7").await.unwrap();
        let calls = api.get_count();

        let detail = engine.episode_detail("7", "7-1").await.unwrap();
        engine.episode_detail("7", "7-1").await.unwrap();

        assert_eq!(detail.id, "7-1");
        assert_eq!(api.get_count(), calls + 1);

        let missing = engine.episode_detail("7", "nope").await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    fn search_api() -> FakeApi {
        let api = api_with_podcast(3);
        api.add_podcast("8", "Morning News");
        api.add_podcast("9", "Radio Storia");
        api
    }

    #[tokio::test]
    async fn search_returns_closest_title_with_newest_episode() {
        let api = search_api();
        let (engine, _clock) = engine(&api);

        let hit = engine.search("  SETE ").await.unwrap();

        assert_eq!(hit.podcast_id, "7");
        assert_eq!(hit.podcast_title, "Sette");
        assert!(hit.score >= SEARCH_CUTOFF);
        assert_eq!(hit.episode_title.as_deref(), Some("Episode 3"));
        assert_eq!(
            hit.episode_url.as_deref(),
            Some("https://cdn.example.com/7-3.mp3")
        );

        let hit = engine.search("storia").await.unwrap();
        assert_eq!(hit.podcast_id, "9");
        assert_eq!(hit.episode_title, None);
    }

    #[tokio::test]
    async fn search_without_a_close_title_is_not_found() {
        let api = search_api();
        let (engine, _clock) = engine(&api);

        assert!(matches!(engine.search("zzzz").await, Err(SyncError::NotFound(_))));
        assert!(matches!(engine.search("   ").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_cache() {
        let api = search_api();
        let (engine, _clock) = engine(&api);

        engine.search("sette").await.unwrap();
        let calls = api.get_count();
        engine.search("sette").await.unwrap();

        assert_eq!(api.get_count(), calls);
    }

    #[tokio::test]
    async fn directory_is_built_once_then_patched() {
        let api = api_with_podcast(2);
        api.add_podcast("8", "Otto");
        api.add_episodes("8", 1);
        let (engine, clock) = engine(&api);

        let directory = engine.directory().await.unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(
            directory.get("7").unwrap().latest_episode_id.as_deref(),
            Some("7-2")
        );
        let calls = api.get_count();

        // Within the TTL nothing is asked upstream
        clock.advance(Duration::minutes(10));
        engine.directory().await.unwrap();
        assert_eq!(api.get_count(), calls);

        // Past the TTL only the probe runs
        api.add_episodes("8", 1);
        clock.advance(Duration::minutes(10));
        let directory = engine.directory().await.unwrap();
        assert_eq!(api.get_count(), calls + 1);
        assert_eq!(api.calls_to("latest"), 2);
        assert_eq!(
            directory.get("8").unwrap().latest_episode_id.as_deref(),
            Some("8-2")
        );
    }

    #[tokio::test]
    async fn directory_probe_records_unverified_summaries() {
        let api = api_with_podcast(2);
        let (engine, _clock) = engine(&api);

        engine.directory().await.unwrap();

        let podcast = engine.store().get_podcast("7").await.unwrap().unwrap();
        assert_eq!(podcast.title, "Sette");
        let episode = engine.store().get_episode_by_external_id("7-2").await.unwrap().unwrap();
        assert!(!episode.description_verified);
        assert_eq!(episode.description, "Summary of 7-2");
    }

    #[tokio::test]
    async fn failed_probe_serves_previous_directory() {
        let api = api_with_podcast(2);
        let (engine, clock) = engine(&api);

        let built = engine.directory().await.unwrap();
        clock.advance(Duration::minutes(20));
        api.fail_with(Some(500));

        let served = engine.directory().await.unwrap();
        assert_eq!(served, built);
    }

    #[tokio::test]
    async fn directory_build_failure_is_surfaced() {
        let api = api_with_podcast(2);
        api.fail_with(Some(500));
        let (engine, _clock) = engine(&api);

        let result = engine.directory().await;
        assert!(matches!(result, Err(SyncError::ServiceUnavailable { .. })));
    }

    #[tokio::test]
    async fn lookup_persists_episodes_of_known_podcasts() {
        let api = api_with_podcast(3);
        api.add_podcast("8", "Otto");
        api.add_episodes("8", 1);
        let (engine, _clock) = engine(&api);
        engine.store().upsert_podcast("7", api_fields("Sette")).await.unwrap();

        let stored = engine
            .lookup_episodes(&["7-1".to_string(), "8-1".to_string()])
            .await
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].external_id, "7-1");
        assert!(stored[0].description_verified);
        assert!(
            engine
                .store()
                .get_episode_by_external_id("8-1")
                .await
                .unwrap()
                .is_none()
        );
    }

    fn api_fields(title: &str) -> PodcastFields {
        PodcastFields {
            title: title.to_string(),
            description: String::new(),
            image_url: String::new(),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_converge_on_one_row_set() {
        let api = api_with_podcast(3);
        let (engine, _clock) = engine(&api);

        let (a, b) = tokio::join!(engine.podcast_episodes("7"), engine.podcast_episodes("7"));
        assert_eq!(a.unwrap().episodes.len(), 3);
        assert_eq!(b.unwrap().episodes.len(), 3);
        assert_eq!(engine.store().episodes_of("7").await.unwrap().len(), 3);
    }
}
