// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::model::{DescriptionSource, EpisodeUpsert, PodcastFields};

/// A podcast as listed by the upstream catalog
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiPodcast {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub author: Option<String>,
}

/// An episode as returned by listing, detail, batch and probe calls
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiEpisode {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Full episode text, present on batch and detail payloads
    #[serde(default)]
    pub content_html: Option<String>,
    /// Short listing text
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub episode_raw_url: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub milliseconds: Option<u64>,
    #[serde(default)]
    pub parent: Option<ApiPodcast>,
}

/// One page of a listing plus the total the upstream reports
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListEnvelope<T> {
    #[serde(default)]
    head: Option<Head>,
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Head {
    #[serde(default)]
    data: Option<HeadData>,
}

#[derive(Debug, Deserialize)]
struct HeadData {
    #[serde(default)]
    total: Option<u64>,
}

impl<T> ListEnvelope<T> {
    /// Falls back to the page length when the head carries no total
    pub fn into_page(self) -> Page<T> {
        let total = self
            .head
            .and_then(|head| head.data)
            .and_then(|data| data.total)
            .map(|total| total as usize)
            .unwrap_or(self.data.len());

        Page {
            total,
            items: self.data,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ItemEnvelope<T> {
    data: OneOrMany<T>,
}

impl<T> ItemEnvelope<T> {
    pub fn into_first(self) -> Option<T> {
        match self.data {
            OneOrMany::One(item) => Some(item),
            OneOrMany::Many(items) => items.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    data: LoginOuter,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoginOuter {
    data: LoginInner,
}

#[derive(Debug, Deserialize)]
struct LoginInner {
    token: String,
}

impl LoginResponse {
    pub fn token(&self) -> &str {
        &self.data.data.token
    }
}

impl ApiPodcast {
    pub fn fields(&self) -> PodcastFields {
        PodcastFields {
            title: self.title.clone(),
            description: self.description.clone(),
            image_url: self.image.clone(),
        }
    }
}

impl ApiEpisode {
    pub fn publication_date(&self) -> Option<DateTime<FixedOffset>> {
        self.date.as_deref().and_then(parse_date)
    }

    pub fn duration_seconds(&self) -> Option<u64> {
        self.milliseconds.map(|ms| ms / 1000)
    }

    /// Full text when available, otherwise the listing summary
    pub fn best_description(&self) -> String {
        self.content_html
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .or(self.description.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_ref().map(|parent| parent.id.as_str())
    }

    pub fn to_upsert(&self, description_source: DescriptionSource) -> EpisodeUpsert {
        EpisodeUpsert {
            external_id: self.id.clone(),
            title: self.title.clone(),
            description: self.best_description(),
            description_source,
            audio_url: self.episode_raw_url.clone(),
            publication_date: self.publication_date(),
            duration_seconds: self.duration_seconds(),
        }
    }
}

/// Ids arrive as JSON numbers or strings depending on the endpoint
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected a string or a number for id")),
    }
}

/// Parse the upstream's dates, which are mostly RFC 3339 but not always
pub fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let date_str = date_str.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt);
    }

    let offset_formats = ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S %z"];
    for format in offset_formats {
        if let Ok(dt) = DateTime::parse_from_str(date_str, format) {
            return Some(dt);
        }
    }

    // No offset at all: the catalog means UTC
    let naive_formats = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    naive_formats.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(date_str, format)
            .ok()
            .map(|naive| naive.and_utc().fixed_offset())
    })
}
