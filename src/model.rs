use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// A podcast as persisted in the store, keyed by its upstream id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: String,
    /// When the episode set was last refreshed from upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// An episode as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub external_id: String,
    pub podcast_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// True once the description came from a detail or full-batch fetch
    #[serde(default)]
    pub description_verified: bool,
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

/// Podcast fields written by an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct PodcastFields {
    pub title: String,
    pub description: String,
    pub image_url: String,
}

/// Where an episode's description text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionSource {
    /// Full episode content from a batch or detail fetch
    Authoritative,
    /// Cheap listing text that still needs a detail backfill
    Summary,
}

/// Episode fields written by an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeUpsert {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub description_source: DescriptionSource,
    pub audio_url: String,
    pub publication_date: Option<DateTime<FixedOffset>>,
    pub duration_seconds: Option<u64>,
}

impl Podcast {
    pub fn new(external_id: &str, fields: PodcastFields) -> Self {
        Self {
            external_id: external_id.to_string(),
            title: fields.title,
            description: fields.description,
            image_url: fields.image_url,
            last_checked_at: None,
        }
    }

    /// Overwrite the mutable fields in place
    pub fn apply(&mut self, fields: PodcastFields) {
        self.title = fields.title;
        self.description = fields.description;
        self.image_url = fields.image_url;
    }
}

impl Episode {
    /// Build a new row for `podcast_id` from an upsert
    pub fn from_upsert(podcast_id: &str, upsert: EpisodeUpsert) -> Self {
        Self {
            external_id: upsert.external_id,
            podcast_id: podcast_id.to_string(),
            title: upsert.title,
            description: upsert.description,
            description_verified: upsert.description_source == DescriptionSource::Authoritative,
            audio_url: upsert.audio_url,
            publication_date: upsert.publication_date,
            duration_seconds: upsert.duration_seconds,
        }
    }

    /// Merge an upsert into an existing row.
    ///
    /// Summary text never replaces a description and never clears the
    /// verification flag; authoritative text always does both.
    pub fn apply(&mut self, podcast_id: &str, upsert: EpisodeUpsert) {
        self.podcast_id = podcast_id.to_string();
        self.title = upsert.title;
        self.audio_url = upsert.audio_url;
        self.publication_date = upsert.publication_date;
        self.duration_seconds = upsert.duration_seconds;

        if upsert.description_source == DescriptionSource::Authoritative {
            self.description = upsert.description;
            self.description_verified = true;
        }
    }
}

/// Sort newest first; undated episodes go last
pub fn sort_newest_first(episodes: &mut [Episode]) {
    episodes.sort_by(|a, b| {
        b.publication_date
            .cmp(&a.publication_date)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
}
