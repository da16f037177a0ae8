use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Store;
use super::catalog::Catalog;
use crate::error::StoreError;
use crate::model::{Episode, EpisodeUpsert, Podcast, PodcastFields};

/// Non-persistent store, used for tests and throwaway runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Catalog) -> T) -> T {
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        f(&*catalog)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Catalog) -> T) -> T {
        let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        f(&mut *catalog)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_podcast(&self, external_id: &str) -> Result<Option<Podcast>, StoreError> {
        Ok(self.read(|catalog| catalog.podcast(external_id).cloned()))
    }

    async fn list_podcasts(&self) -> Result<Vec<Podcast>, StoreError> {
        Ok(self.read(Catalog::podcasts))
    }

    async fn upsert_podcast(
        &self,
        external_id: &str,
        fields: PodcastFields,
    ) -> Result<Podcast, StoreError> {
        Ok(self.write(|catalog| {
            let podcast = catalog.merged_podcast(external_id, fields);
            catalog.put_podcast(podcast.clone());
            podcast
        }))
    }

    async fn episodes_of(&self, podcast_id: &str) -> Result<Vec<Episode>, StoreError> {
        Ok(self.read(|catalog| catalog.episodes_of(podcast_id)))
    }

    async fn upsert_episode(
        &self,
        podcast_id: &str,
        upsert: EpisodeUpsert,
    ) -> Result<Episode, StoreError> {
        self.write(|catalog| {
            let (episode, _) = catalog.merged_episode(podcast_id, upsert)?;
            catalog.put_episode(episode.clone());
            Ok(episode)
        })
    }

    async fn mark_description_verified(
        &self,
        external_id: &str,
        description: Option<String>,
    ) -> Result<Episode, StoreError> {
        self.write(|catalog| {
            let episode = catalog.verified_episode(external_id, description)?;
            catalog.put_episode(episode.clone());
            Ok(episode)
        })
    }

    async fn get_episode_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Episode>, StoreError> {
        Ok(self.read(|catalog| catalog.episode(external_id).cloned()))
    }

    async fn touch_last_checked(
        &self,
        podcast_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Podcast, StoreError> {
        self.write(|catalog| {
            let mut podcast = catalog
                .podcast(podcast_id)
                .cloned()
                .ok_or_else(|| StoreError::PodcastNotFound(podcast_id.to_string()))?;
            podcast.last_checked_at = Some(at);
            catalog.put_podcast(podcast.clone());
            Ok(podcast)
        })
    }

    async fn delete_podcast(&self, podcast_id: &str) -> Result<bool, StoreError> {
        Ok(self.write(|catalog| catalog.remove_podcast(podcast_id).is_some()))
    }
}
