use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::upstream::{ApiEpisode, ApiPodcast};

/// One podcast in the directory with its most recent episode
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub podcast_id: String,
    pub title: String,
    pub image_url: String,
    pub latest_episode_id: Option<String>,
    pub latest_episode_title: Option<String>,
    pub latest_date: Option<DateTime<FixedOffset>>,
}

impl DirectoryEntry {
    fn from_podcast(podcast: &ApiPodcast) -> Self {
        Self {
            podcast_id: podcast.id.clone(),
            title: podcast.title.clone(),
            image_url: podcast.image.clone(),
            latest_episode_id: None,
            latest_episode_title: None,
            latest_date: None,
        }
    }

    /// Take `episode` as the latest one if it is newer than what we hold
    fn advance(&mut self, episode: &ApiEpisode) -> bool {
        let Some(date) = episode.publication_date() else {
            return false;
        };
        if self.latest_date.is_some_and(|current| date <= current) {
            return false;
        }

        self.latest_episode_id = Some(episode.id.clone());
        self.latest_episode_title = Some(episode.title.clone());
        self.latest_date = Some(date);
        true
    }
}

/// Aggregate of every podcast and its latest episode.
///
/// Built once from the full podcast list, then patched from the latest
/// episode probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Directory {
    entries: BTreeMap<String, DirectoryEntry>,
    checked_at: DateTime<Utc>,
}

impl Directory {
    /// Full build from the podcast list and one probe
    pub fn build(podcasts: &[ApiPodcast], latest: &[ApiEpisode], now: DateTime<Utc>) -> Self {
        let mut directory = Self {
            entries: podcasts
                .iter()
                .map(|podcast| (podcast.id.clone(), DirectoryEntry::from_podcast(podcast)))
                .collect(),
            checked_at: now,
        };
        directory.patch(latest, now);
        directory
    }

    /// Apply a probe result, touching only podcasts whose latest date advanced.
    ///
    /// Podcasts the directory has never seen are added from the episode's
    /// parent. Returns the ids of the entries that changed.
    pub fn patch(&mut self, latest: &[ApiEpisode], now: DateTime<Utc>) -> Vec<String> {
        let mut patched = Vec::new();

        for episode in latest {
            let Some(parent) = &episode.parent else {
                continue;
            };
            let entry = self
                .entries
                .entry(parent.id.clone())
                .or_insert_with(|| DirectoryEntry::from_podcast(parent));

            if entry.advance(episode) {
                patched.push(parent.id.clone());
            }
        }

        self.checked_at = now;
        patched
    }

    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }

    /// Whether the last build or probe is younger than `ttl`
    pub fn is_current(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.checked_at < ttl
    }

    pub fn get(&self, podcast_id: &str) -> Option<&DirectoryEntry> {
        self.entries.get(podcast_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with the most recently updated podcasts first
    pub fn newest_first(&self) -> Vec<&DirectoryEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.latest_date
                .cmp(&a.latest_date)
                .then_with(|| a.title.cmp(&b.title))
        });
        entries
    }
}
