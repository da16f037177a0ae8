use std::collections::HashMap;

use crate::error::StoreError;
use crate::model::{Episode, EpisodeUpsert, Podcast, PodcastFields, sort_newest_first};

/// In-memory index of podcasts and episodes shared by both store backends
#[derive(Debug, Default, Clone)]
pub(super) struct Catalog {
    podcasts: HashMap<String, Podcast>,
    episodes: HashMap<String, Episode>,
}

impl Catalog {
    pub fn podcast(&self, external_id: &str) -> Option<&Podcast> {
        self.podcasts.get(external_id)
    }

    pub fn episode(&self, external_id: &str) -> Option<&Episode> {
        self.episodes.get(external_id)
    }

    pub fn podcasts(&self) -> Vec<Podcast> {
        let mut podcasts: Vec<_> = self.podcasts.values().cloned().collect();
        podcasts.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        podcasts
    }

    pub fn episodes_of(&self, podcast_id: &str) -> Vec<Episode> {
        let mut episodes: Vec<_> = self
            .episodes
            .values()
            .filter(|episode| episode.podcast_id == podcast_id)
            .cloned()
            .collect();
        sort_newest_first(&mut episodes);
        episodes
    }

    /// The podcast row an upsert would produce, without committing it
    pub fn merged_podcast(&self, external_id: &str, fields: PodcastFields) -> Podcast {
        match self.podcasts.get(external_id) {
            Some(existing) => {
                let mut podcast = existing.clone();
                podcast.apply(fields);
                podcast
            }
            None => Podcast::new(external_id, fields),
        }
    }

    /// The episode row an upsert would produce, plus the row it replaces
    pub fn merged_episode(
        &self,
        podcast_id: &str,
        upsert: EpisodeUpsert,
    ) -> Result<(Episode, Option<Episode>), StoreError> {
        if !self.podcasts.contains_key(podcast_id) {
            return Err(StoreError::PodcastNotFound(podcast_id.to_string()));
        }

        match self.episodes.get(&upsert.external_id) {
            Some(existing) => {
                let mut episode = existing.clone();
                episode.apply(podcast_id, upsert);
                Ok((episode, Some(existing.clone())))
            }
            None => Ok((Episode::from_upsert(podcast_id, upsert), None)),
        }
    }

    /// The stored episode with its description verified, without committing it
    pub fn verified_episode(
        &self,
        external_id: &str,
        description: Option<String>,
    ) -> Result<Episode, StoreError> {
        let mut episode = self
            .episodes
            .get(external_id)
            .cloned()
            .ok_or_else(|| StoreError::EpisodeNotFound(external_id.to_string()))?;

        if let Some(description) = description {
            episode.description = description;
        }
        episode.description_verified = true;
        Ok(episode)
    }

    pub fn put_podcast(&mut self, podcast: Podcast) {
        self.podcasts.insert(podcast.external_id.clone(), podcast);
    }

    pub fn put_episode(&mut self, episode: Episode) {
        self.episodes.insert(episode.external_id.clone(), episode);
    }

    /// Drop a podcast and every episode that belongs to it
    pub fn remove_podcast(&mut self, podcast_id: &str) -> Option<Podcast> {
        let podcast = self.podcasts.remove(podcast_id)?;
        self.episodes
            .retain(|_, episode| episode.podcast_id != podcast_id);
        Some(podcast)
    }
}
