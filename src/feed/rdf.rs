use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use xml::common::XmlVersion;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use super::{FEED_LANGUAGE, FeedOptions, publication_date};
use crate::error::FeedError;
use crate::feed::sanitize_text;
use crate::model::{Episode, Podcast};

const RDF_NAMESPACE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const RSS1_NAMESPACE: &str = "http://purl.org/rss/1.0/";
const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";

/// Render an RDF/XML (RSS 1.0) document with Dublin Core metadata.
///
/// Each episode is identified by its audio URL, listed once in the channel's
/// `rdf:Seq` and once as an `item`.
pub fn render_rdf(
    podcast: &Podcast,
    episodes: &[Episode],
    options: &FeedOptions,
    now: DateTime<Utc>,
) -> Result<String, FeedError> {
    let mut writer = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(Vec::new());

    writer.write(XmlEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("UTF-8"),
        standalone: None,
    })?;
    writer.write(
        XmlEvent::start_element("rdf:RDF")
            .ns("rdf", RDF_NAMESPACE)
            .default_ns(RSS1_NAMESPACE)
            .ns("dc", DC_NAMESPACE),
    )?;

    write_channel(&mut writer, podcast, episodes, options, now)?;
    if !podcast.image_url.is_empty() {
        write_image(&mut writer, podcast, options)?;
    }
    for episode in episodes {
        write_item(&mut writer, episode, options, now)?;
    }

    writer.write(XmlEvent::end_element())?;

    let mut document = String::from_utf8(writer.into_inner())?;
    document.push('\n');
    Ok(document)
}

fn write_channel<W: Write>(
    writer: &mut EventWriter<W>,
    podcast: &Podcast,
    episodes: &[Episode],
    options: &FeedOptions,
    now: DateTime<Utc>,
) -> Result<(), FeedError> {
    let link = options.podcast_link(&podcast.external_id);
    let channel_date = episodes
        .iter()
        .filter_map(|episode| episode.publication_date)
        .max()
        .unwrap_or_else(|| now.fixed_offset());

    writer.write(XmlEvent::start_element("channel").attr("rdf:about", &link))?;
    text_element(writer, "title", &sanitize_text(&podcast.title))?;
    text_element(writer, "link", &link)?;
    text_element(writer, "description", &sanitize_text(&podcast.description))?;
    text_element(writer, "dc:language", FEED_LANGUAGE)?;
    if !options.author.is_empty() {
        text_element(writer, "dc:creator", &options.author)?;
        text_element(writer, "dc:publisher", &options.author)?;
    }
    text_element(writer, "dc:subject", &options.category)?;
    text_element(
        writer,
        "dc:date",
        &channel_date.to_rfc3339_opts(SecondsFormat::Secs, false),
    )?;
    if !podcast.image_url.is_empty() {
        empty_element(writer, "image", "rdf:resource", &podcast.image_url)?;
    }

    writer.write(XmlEvent::start_element("items"))?;
    writer.write(XmlEvent::start_element("rdf:Seq"))?;
    for episode in episodes {
        empty_element(writer, "rdf:li", "rdf:resource", &episode.audio_url)?;
    }
    writer.write(XmlEvent::end_element())?;
    writer.write(XmlEvent::end_element())?;

    writer.write(XmlEvent::end_element())?;
    Ok(())
}

fn write_image<W: Write>(
    writer: &mut EventWriter<W>,
    podcast: &Podcast,
    options: &FeedOptions,
) -> Result<(), FeedError> {
    writer.write(XmlEvent::start_element("image").attr("rdf:about", &podcast.image_url))?;
    text_element(writer, "title", &sanitize_text(&podcast.title))?;
    text_element(writer, "url", &podcast.image_url)?;
    text_element(writer, "link", &options.podcast_link(&podcast.external_id))?;
    writer.write(XmlEvent::end_element())?;
    Ok(())
}

fn write_item<W: Write>(
    writer: &mut EventWriter<W>,
    episode: &Episode,
    options: &FeedOptions,
    now: DateTime<Utc>,
) -> Result<(), FeedError> {
    let date = publication_date(episode, now);

    writer.write(XmlEvent::start_element("item").attr("rdf:about", &episode.audio_url))?;
    text_element(writer, "title", &sanitize_text(&episode.title))?;
    text_element(writer, "link", &episode.audio_url)?;
    text_element(writer, "description", &sanitize_text(&episode.description))?;
    text_element(
        writer,
        "dc:date",
        &date.to_rfc3339_opts(SecondsFormat::Secs, false),
    )?;
    text_element(writer, "dc:identifier", &episode.external_id)?;
    if !options.author.is_empty() {
        text_element(writer, "dc:creator", &options.author)?;
    }
    writer.write(XmlEvent::end_element())?;
    Ok(())
}

fn text_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> xml::writer::Result<()> {
    writer.write(XmlEvent::start_element(name))?;
    writer.write(XmlEvent::characters(text))?;
    writer.write(XmlEvent::end_element())
}

fn empty_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    attribute: &str,
    value: &str,
) -> xml::writer::Result<()> {
    writer.write(XmlEvent::start_element(name).attr(attribute, value))?;
    writer.write(XmlEvent::end_element())
}
