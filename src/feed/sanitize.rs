/// Typographic characters replaced with plain equivalents
const SUBSTITUTIONS: &[(char, &str)] = &[
    ('&', "e"),
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{201A}', "'"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    ('\u{201E}', "\""),
    ('\u{00AB}', "\""),
    ('\u{00BB}', "\""),
    ('\u{2013}', "-"),
    ('\u{2014}', "-"),
    ('\u{2026}', "..."),
    ('\u{00A0}', " "),
];

/// Elements that separate words; they survive cleaning so they can become spaces
const BREAKING_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "blockquote", "tr", "td",
];

/// Turn upstream HTML into plain text that any feed reader accepts.
///
/// Markup is cleaned first, so text that only looks like markup once its
/// entities are decoded is kept. Then entities are decoded, typographic
/// characters replaced and runs of whitespace collapsed to a single space.
pub fn sanitize_text(input: &str) -> String {
    let cleaned = ammonia::Builder::empty()
        .tags(BREAKING_TAGS.iter().copied().collect())
        .clean_content_tags(["script", "style"].into_iter().collect())
        .clean(input)
        .to_string();
    let stripped = strip_tags(&cleaned);
    let decoded = html_escape::decode_html_entities(&stripped);

    let mut substituted = String::with_capacity(decoded.len());
    for c in decoded.chars() {
        match SUBSTITUTIONS.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => substituted.push_str(to),
            None => substituted.push(c),
        }
    }

    substituted.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace the tags of cleaned markup with spaces.
///
/// Only valid on cleaner output, where every literal `<` in text is escaped.
fn strip_tags(cleaned: &str) -> String {
    let mut out = String::with_capacity(cleaned.len());
    let mut in_tag = false;

    for c in cleaned.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out
}
