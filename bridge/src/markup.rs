//! Text shaping between mail and board: HTML to board markup, plain text to
//! mail HTML, card names, the description parameter block and comments.

use std::collections::HashMap;

use regex::{Captures, Regex};
use tracing::warn;

use crate::address::parse_addresses;
use crate::subject;

/// Longest comment posted for an inbound message.
pub const MAX_COMMENT_LEN: usize = 15_000;

/// Column width used when flattening HTML.
const MARKUP_WIDTH: usize = 80;

/// Convert mail HTML to the board's lightweight markup.
pub fn html_to_markup(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), MARKUP_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(error = %e, html_length = html.len(), "markup_conversion_failed");
            String::new()
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render a comment as mail HTML: blank lines split paragraphs, single
/// newlines become `<br>`.
pub fn text_to_html(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>\n")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Point `cid:` references at their uploaded URLs. `urls` maps content ids
/// to the new location.
pub fn rewrite_content_ids(body: &str, urls: &HashMap<String, String>) -> String {
    let mut out = body.to_string();
    for (cid, url) in urls {
        out = out.replace(&format!("cid:{cid}"), url);
    }
    out
}

pub fn card_name(sender: &str, raw_subject: &str) -> String {
    format!("{} :: {}", sender, subject::normalize(raw_subject))
}

/// Parameters shown in a card description, editable by board users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionParams {
    pub to: String,
    pub recipient: String,
    pub from: String,
    pub reply_to: String,
    pub subject: String,
}

impl DescriptionParams {
    /// Recipients listed in `reply-to`.
    pub fn recipients(&self) -> Vec<String> {
        parse_addresses(&self.reply_to)
    }
}

pub fn card_description(params: &DescriptionParams) -> String {
    format!(
        "\n---\n\nto: {}\nrecipient: {}\nfrom: {}\nreply-to: {}\nsubject: {}\n\n---\n",
        params.to, params.recipient, params.from, params.reply_to, params.subject
    )
}

/// Read the parameter block back from a card description.
///
/// The block sits between `---\n\n` and `\n\n---`. `subject` and `reply-to`
/// are required.
pub fn parse_description(desc: &str) -> Option<DescriptionParams> {
    let (_, rest) = desc.split_once("---\n\n")?;
    let (block, _) = rest.split_once("\n\n---")?;

    let mut params = DescriptionParams::default();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "to" => params.to = value,
            "recipient" => params.recipient = value,
            "from" => params.from = value,
            "reply-to" => params.reply_to = value,
            "subject" => params.subject = value,
            _ => {}
        }
    }

    if params.subject.is_empty() || params.reply_to.is_empty() {
        return None;
    }
    Some(params)
}

/// Comment posted for an inbound message: a link to the full body, the
/// sender and the quoted text.
pub fn compose_comment(body_url: &str, sender: &str, text: &str) -> String {
    let quoted = text.lines().collect::<Vec<_>>().join("\n> ");
    let comment = format!("[:envelope_with_arrow:]({body_url}) {sender}:\n\n> {quoted}");
    if comment.len() <= MAX_COMMENT_LEN {
        return comment;
    }

    let mut cut = MAX_COMMENT_LEN;
    while !comment.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n---\n\nMESSAGE TRUNCATED, see [attachment]({}).",
        &comment[..cut],
        body_url
    )
}

/// Remove a leading envelope marker. `None` when the text carries none.
pub fn strip_marker<'a>(text: &'a str, markers: &[String]) -> Option<&'a str> {
    let trimmed = text.trim_start();
    markers
        .iter()
        .find_map(|marker| trimmed.strip_prefix(marker.as_str()))
        .map(str::trim_start)
}

/// Render a signature template. `{NAME}` and `{USERNAME}` are substituted;
/// any other placeholder makes the template unusable.
pub fn render_signature(template: &str, name: &str, username: &str) -> Option<String> {
    let placeholder = match Regex::new(r"\{\s*([A-Za-z_]*)\s*\}") {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "signature_pattern_invalid");
            return None;
        }
    };

    let mut unknown = None;
    let rendered = placeholder.replace_all(template, |caps: &Captures| match &caps[1] {
        "NAME" => name.to_string(),
        "USERNAME" => username.to_string(),
        other => {
            unknown.get_or_insert_with(|| other.to_string());
            String::new()
        }
    });

    if let Some(field) = unknown {
        warn!(field = %field, signature = %template, "signature_render_failed");
        return None;
    }
    Some(rendered.into_owned())
}
