//! Syndication feeds rendered from stored podcasts and episodes

mod channel;
mod rdf;
mod sanitize;

pub use channel::render_rss;
pub use rdf::render_rdf;
pub use sanitize::sanitize_text;

use chrono::{DateTime, FixedOffset, Utc};
use url::Url;

use crate::model::Episode;

/// Language declared by every feed
pub const FEED_LANGUAGE: &str = "it";

/// Channel-level settings shared by both feed formats
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Public site the channel links point at
    pub base_url: Url,
    pub author: String,
    pub owner_name: String,
    pub owner_email: String,
    pub category: String,
    pub explicit: bool,
}

impl FeedOptions {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            author: String::new(),
            owner_name: String::new(),
            owner_email: String::new(),
            category: "Society & Culture".to_string(),
            explicit: false,
        }
    }

    /// Public page of one podcast
    pub fn podcast_link(&self, podcast_id: &str) -> String {
        format!(
            "{}/podcast/{}",
            self.base_url.as_str().trim_end_matches('/'),
            podcast_id
        )
    }
}

/// `H:MM:SS` from one hour up, `M:SS` below
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// The stored date, or `now` when the episode has none
fn publication_date(episode: &Episode, now: DateTime<Utc>) -> DateTime<FixedOffset> {
    episode
        .publication_date
        .unwrap_or_else(|| now.fixed_offset())
}

/// MIME type for an enclosure, guessed from the file extension
fn audio_mime_type(audio_url: &str) -> &'static str {
    let extension = Url::parse(audio_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|filename| filename.rsplit_once('.'))
                .map(|(_, ext)| ext.to_lowercase())
        })
        .unwrap_or_default();

    match extension.as_str() {
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        _ => "audio/mpeg",
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_below_an_hour() {
        assert_eq!(format_duration(125), "2:05");
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(3599), "59:59");
    }

    #[test]
    fn duration_from_an_hour() {
        assert_eq!(format_duration(3600), "1:00:00");
        assert_eq!(format_duration(3725), "1:02:05");
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(audio_mime_type("https://cdn.example.com/a.mp3"), "audio/mpeg");
        assert_eq!(audio_mime_type("https://cdn.example.com/a.M4A?x=1"), "audio/mp4");
        assert_eq!(audio_mime_type("https://cdn.example.com/stream"), "audio/mpeg");
        assert_eq!(audio_mime_type("not a url"), "audio/mpeg");
    }

    #[test]
    fn podcast_link_joins_without_double_slash() {
        let options = fixtures::options();
        assert_eq!(
            options.podcast_link("42"),
            "https://podcasts.example.com/podcast/42"
        );
    }
}
