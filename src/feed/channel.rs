// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rss::extension::itunes::{
    ITunesCategoryBuilder, ITunesChannelExtensionBuilder, ITunesItemExtensionBuilder,
    ITunesOwnerBuilder,
};
use rss::extension::{Extension, ExtensionBuilder, ExtensionMap};
use rss::{
    CategoryBuilder, ChannelBuilder, EnclosureBuilder, GuidBuilder, ImageBuilder, Item,
    ItemBuilder,
};

use super::{FEED_LANGUAGE, FeedOptions, audio_mime_type, format_duration, publication_date};
use crate::error::FeedError;
use crate::feed::sanitize_text;
use crate::model::{Episode, Podcast};

const GOOGLEPLAY_PREFIX: &str = "googleplay";
const GOOGLEPLAY_NAMESPACE: &str = "http://www.google.com/schemas/play-podcasts/1.0";

/// Render an RSS 2.0 document with iTunes and Google Play tags.
///
/// Episodes are written in the order given. `now` stands in for missing
/// publication dates.
pub fn render_rss(
    podcast: &Podcast,
    episodes: &[Episode],
    options: &FeedOptions,
    now: DateTime<Utc>,
) -> Result<String, FeedError> {
    let title = sanitize_text(&podcast.title);
    let description = sanitize_text(&podcast.description);
    let link = options.podcast_link(&podcast.external_id);
    let explicit = if options.explicit { "yes" } else { "no" };

    let owner = ITunesOwnerBuilder::default()
        .name(Some(options.owner_name.clone()))
        .email(Some(options.owner_email.clone()))
        .build();
    let itunes_category = ITunesCategoryBuilder::default()
        .text(options.category.clone())
        .build();
    let itunes = ITunesChannelExtensionBuilder::default()
        .author(Some(options.author.clone()))
        .owner(Some(owner))
        .categories(vec![itunes_category])
        .image(non_empty(&podcast.image_url))
        .explicit(Some(explicit.to_string()))
        .summary(Some(description.clone()))
        .build();

    let mut googleplay = BTreeMap::new();
    push_extension(&mut googleplay, "author", &options.author);
    push_extension(&mut googleplay, "description", &description);
    push_extension(&mut googleplay, "explicit", explicit);
    if !podcast.image_url.is_empty() {
        let image = ExtensionBuilder::default()
            .name(format!("{GOOGLEPLAY_PREFIX}:image"))
            .attrs(BTreeMap::from([("href".to_string(), podcast.image_url.clone())]))
            .build();
        googleplay.insert("image".to_string(), vec![image]);
    }
    let mut extensions = ExtensionMap::new();
    extensions.insert(GOOGLEPLAY_PREFIX.to_string(), googleplay);

    let image = non_empty(&podcast.image_url).map(|url| {
        ImageBuilder::default()
            .url(url)
            .title(title.clone())
            .link(link.clone())
            .build()
    });

    let items: Vec<Item> = episodes
        .iter()
        .map(|episode| render_item(episode, options, now))
        .collect();

    let channel = ChannelBuilder::default()
        .namespaces(BTreeMap::from([(
            GOOGLEPLAY_PREFIX.to_string(),
            GOOGLEPLAY_NAMESPACE.to_string(),
        )]))
        .title(title)
        .link(link)
        .description(description)
        .language(Some(FEED_LANGUAGE.to_string()))
        .managing_editor(non_empty(&options.owner_email))
        .categories(vec![
            CategoryBuilder::default()
                .name(options.category.clone())
                .build(),
        ])
        .image(image)
        .itunes_ext(Some(itunes))
        .extensions(extensions)
        .items(items)
        .build();

    let bytes = channel.write_to(Vec::new())?;
    Ok(String::from_utf8(bytes)?)
}

fn render_item(episode: &Episode, options: &FeedOptions, now: DateTime<Utc>) -> Item {
    let description = sanitize_text(&episode.description);

    // The audio URL doubles as the item identity clients deduplicate on
    let guid = GuidBuilder::default()
        .value(episode.audio_url.clone())
        .permalink(true)
        .build();
    let enclosure = EnclosureBuilder::default()
        .url(episode.audio_url.clone())
        .length("0".to_string())
        .mime_type(audio_mime_type(&episode.audio_url).to_string())
        .build();
    let itunes = ITunesItemExtensionBuilder::default()
        .author(Some(options.author.clone()))
        .duration(episode.duration_seconds.map(format_duration))
        .summary(Some(description.clone()))
        .build();

    let mut googleplay = BTreeMap::new();
    push_extension(&mut googleplay, "description", &description);
    let mut extensions = ExtensionMap::new();
    extensions.insert(GOOGLEPLAY_PREFIX.to_string(), googleplay);

    ItemBuilder::default()
        .title(Some(sanitize_text(&episode.title)))
        .link(Some(episode.audio_url.clone()))
        .description(Some(description))
        .guid(Some(guid))
        .pub_date(Some(publication_date(episode, now).to_rfc2822()))
        .enclosure(Some(enclosure))
        .itunes_ext(Some(itunes))
        .extensions(extensions)
        .build()
}

fn push_extension(map: &mut BTreeMap<String, Vec<Extension>>, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let extension = ExtensionBuilder::default()
        .name(format!("{GOOGLEPLAY_PREFIX}:{name}"))
        .value(Some(value.to_string()))
        .build();
    map.entry(name.to_string()).or_default().push(extension);
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
