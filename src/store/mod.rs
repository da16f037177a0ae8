mod catalog;
mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::model::{Episode, EpisodeUpsert, Podcast, PodcastFields};

/// How long a refreshed podcast is served from the store without asking upstream
pub const DEFAULT_STORE_FRESHNESS_SECS: i64 = 60 * 60;

/// Outcome of a batch of per-episode upserts
#[derive(Debug, Default)]
pub struct UpsertReport {
    /// Episodes written successfully
    pub written: usize,
    /// Episodes whose write failed, with the reason
    pub failures: Vec<(String, StoreError)>,
}

/// Persisted catalog of podcasts and episodes keyed by upstream id.
///
/// Every write commits a single podcast or a single episode. Writing the same
/// external id twice updates the existing row in place.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_podcast(&self, external_id: &str) -> Result<Option<Podcast>, StoreError>;

    async fn list_podcasts(&self) -> Result<Vec<Podcast>, StoreError>;

    /// Create the podcast if absent, otherwise overwrite its fields
    async fn upsert_podcast(
        &self,
        external_id: &str,
        fields: PodcastFields,
    ) -> Result<Podcast, StoreError>;

    /// All episodes of a podcast, newest first
    async fn episodes_of(&self, podcast_id: &str) -> Result<Vec<Episode>, StoreError>;

    /// Create or update one episode under `podcast_id`
    async fn upsert_episode(
        &self,
        podcast_id: &str,
        upsert: EpisodeUpsert,
    ) -> Result<Episode, StoreError>;

    /// Mark an episode's description as verified, replacing its text when
    /// `description` is given. No other field of the stored row changes.
    async fn mark_description_verified(
        &self,
        external_id: &str,
        description: Option<String>,
    ) -> Result<Episode, StoreError>;

    async fn get_episode_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Episode>, StoreError>;

    /// Stamp the podcast as refreshed at `at`
    async fn touch_last_checked(
        &self,
        podcast_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Podcast, StoreError>;

    /// Remove a podcast together with all its episodes
    async fn delete_podcast(&self, podcast_id: &str) -> Result<bool, StoreError>;

    /// Episodes of a podcast plus whether they need a refresh.
    ///
    /// A podcast is fresh only when it has episodes and was checked less than
    /// `window` before `now`. Unknown podcasts come back empty and stale.
    async fn get_episodes(
        &self,
        podcast_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<(Vec<Episode>, bool), StoreError> {
        let Some(podcast) = self.get_podcast(podcast_id).await? else {
            return Ok((Vec::new(), true));
        };

        let episodes = self.episodes_of(podcast_id).await?;
        let stale = !is_fresh(&podcast, !episodes.is_empty(), now, window);
        Ok((episodes, stale))
    }

    /// Upsert each episode on its own, collecting failures instead of aborting
    async fn upsert_episodes(&self, podcast_id: &str, batch: Vec<EpisodeUpsert>) -> UpsertReport {
        let mut report = UpsertReport::default();

        for upsert in batch {
            let external_id = upsert.external_id.clone();
            match self.upsert_episode(podcast_id, upsert).await {
                Ok(_) => report.written += 1,
                Err(e) => {
                    tracing::warn!(
                        podcast_id,
                        episode_id = %external_id,
                        error = %e,
                        "Failed to persist episode, continuing"
                    );
                    report.failures.push((external_id, e));
                }
            }
        }

        report
    }

    /// Ids of the podcast's episodes whose description still needs a detail fetch
    async fn unverified_episode_ids(&self, podcast_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .episodes_of(podcast_id)
            .await?
            .into_iter()
            .filter(|episode| !episode.description_verified)
            .map(|episode| episode.external_id)
            .collect())
    }
}

/// Store-level freshness: checked within `window` and already holding episodes
pub fn is_fresh(
    podcast: &Podcast,
    has_episodes: bool,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    has_episodes
        && podcast
            .last_checked_at
            .is_some_and(|checked| now - checked < window)
}
