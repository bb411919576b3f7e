//! Mailgun "store and notify" form payloads.
//!
//! Mailgun posts pre-parsed mail: bodies, stripped quotes, attachment URLs
//! and the original headers as a JSON array of `[name, value]` pairs. The
//! headers are mandatory since threading depends on them.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{info, warn};

use super::{AttachmentSource, Envelope, InboundAttachment, InboundMessage};
use crate::address::normalize_message_id;
use crate::error::BridgeError;

/// Mailgun form payload. Field names use hyphens, which are renamed here.
#[derive(Debug, Default, Deserialize)]
pub struct MailgunForm {
    pub recipient: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, rename = "from")]
    pub from_field: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, rename = "Subject")]
    pub subject_header: Option<String>,
    #[serde(default, rename = "body-plain")]
    pub body_plain: Option<String>,
    #[serde(default, rename = "body-html")]
    pub body_html: Option<String>,
    #[serde(default, rename = "stripped-text")]
    pub stripped_text: Option<String>,
    #[serde(default, rename = "stripped-html")]
    pub stripped_html: Option<String>,
    #[serde(default, rename = "message-headers")]
    pub message_headers: Option<String>,
    #[serde(default)]
    pub attachments: Option<String>,
    #[serde(default, rename = "content-id-map")]
    pub content_id_map: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct StoredAttachment {
    url: String,
    #[serde(default, rename = "content-type")]
    content_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
}

/// At most `max` characters of `raw`, cut on a char boundary.
fn preview(raw: &str, max: usize) -> &str {
    raw.char_indices().nth(max).map_or(raw, |(i, _)| &raw[..i])
}

/// Parse Mailgun's message-headers JSON into name/value pairs.
fn parse_headers(message_headers: Option<&str>) -> Result<Vec<(String, String)>, BridgeError> {
    let raw = message_headers
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| BridgeError::Validation("missing message-headers".into()))?;

    let pairs: Vec<Vec<String>> = serde_json::from_str(raw).map_err(|e| {
        warn!(
            error = %e,
            headers_preview = preview(raw, 200),
            "mailgun_headers_parse_failed"
        );
        BridgeError::Validation(format!("invalid message-headers: {e}"))
    })?;

    Ok(pairs
        .into_iter()
        .filter(|pair| pair.len() >= 2)
        .map(|mut pair| {
            let value = pair.swap_remove(1);
            (pair.swap_remove(0), value)
        })
        .collect())
}

/// First value of a header, case-insensitive.
fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Build an [`InboundMessage`] from a Mailgun form post.
pub fn parse_mailgun(form: MailgunForm) -> Result<InboundMessage, BridgeError> {
    info!(
        recipient = %form.recipient,
        has_body_html = form.body_html.is_some(),
        has_message_headers = form.message_headers.is_some(),
        "mailgun_parse_start"
    );

    let headers = parse_headers(form.message_headers.as_deref())?;

    let attachments: Vec<StoredAttachment> = match form.attachments.as_deref() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "mailgun_attachments_parse_failed");
            Vec::new()
        }),
        _ => Vec::new(),
    };

    let content_ids: HashMap<String, String> = match form.content_id_map.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str::<HashMap<String, String>>(raw)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "mailgun_content_id_map_parse_failed");
                    HashMap::new()
                })
                .into_iter()
                .map(|(cid, url)| (normalize_message_id(&cid), url))
                .collect()
        }
        _ => HashMap::new(),
    };

    let from = if form.from_field.trim().is_empty() {
        header(&headers, "From").unwrap_or(&form.sender).to_string()
    } else {
        form.from_field.clone()
    };
    let subject = if form.subject.is_empty() {
        form.subject_header
            .clone()
            .or_else(|| header(&headers, "Subject").map(str::to_string))
            .unwrap_or_default()
    } else {
        form.subject.clone()
    };

    let (recipient, sender, message_id, in_reply_to) = Envelope {
        recipient: &form.recipient,
        from: &from,
        reply_to: header(&headers, "Reply-To"),
        message_id: header(&headers, "Message-Id"),
        in_reply_to: header(&headers, "In-Reply-To"),
        subject: &subject,
    }
    .identity();

    let message = InboundMessage {
        recipient,
        to: header(&headers, "To").unwrap_or_default().to_string(),
        from,
        sender,
        subject,
        message_id,
        in_reply_to,
        body_plain: form.body_plain.unwrap_or_default(),
        body_html: non_empty(form.body_html),
        stripped_text: non_empty(form.stripped_text),
        stripped_html: non_empty(form.stripped_html),
        attachments: attachments
            .into_iter()
            .map(|a| InboundAttachment {
                reference: a.url.clone(),
                name: a.name,
                content_type: a.content_type,
                size: a.size,
                source: AttachmentSource::Remote(a.url),
            })
            .collect(),
        content_ids,
    };

    info!(
        message_id = %message.message_id,
        sender = %message.sender,
        attachments = message.attachments.len(),
        "mailgun_parse_complete"
    );

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> MailgunForm {
        MailgunForm {
            recipient: "Support@BoardThreads.com".into(),
            sender: "bounce@y.com".into(),
            from_field: "Cliente <c@y.com>".into(),
            subject: "Re: Help".into(),
            body_plain: Some("hello".into()),
            body_html: Some("<p>hello <img src=\"cid:img1\"></p>".into()),
            stripped_text: Some("hello".into()),
            stripped_html: Some("".into()),
            message_headers: Some(
                r#"[["Message-Id", "<m2@y.com>"], ["In-Reply-To", "<m1@y.com>"], ["To", "Support <support@boardthreads.com>"]]"#
                    .into(),
            ),
            attachments: Some(
                r#"[{"url": "https://mg.test/a1", "content-type": "image/png", "name": "img.png", "size": 120}]"#
                    .into(),
            ),
            content_id_map: Some(r#"{"<img1>": "https://mg.test/a1"}"#.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_headers_case_insensitive() {
        let headers =
            parse_headers(Some(r#"[["message-id", "<test@example.com>"], ["subject", "Test"]]"#))
                .unwrap();
        assert_eq!(header(&headers, "Message-Id"), Some("<test@example.com>"));
        assert_eq!(header(&headers, "Reply-To"), None);
    }

    #[test]
    fn test_parse_headers_invalid_json() {
        assert!(matches!(
            parse_headers(Some("not valid json")),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(parse_headers(None), Err(BridgeError::Validation(_))));
        assert!(matches!(parse_headers(Some("")), Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_parse_headers_invalid_non_ascii() {
        let raw = format!("a{}", "é".repeat(150));
        assert_eq!(preview(&raw, 200).chars().count(), 151);
        assert_eq!(preview(&raw, 3), "aéé");

        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        let result = tracing::subscriber::with_default(subscriber, || parse_headers(Some(&raw)));
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_parse_mailgun_full() {
        let message = parse_mailgun(form()).unwrap();
        assert_eq!(message.recipient, "support@boardthreads.com");
        assert_eq!(message.sender, "c@y.com");
        assert_eq!(message.message_id, "m2@y.com");
        assert_eq!(message.thread_key(), "m1@y.com");
        assert_eq!(message.to, "Support <support@boardthreads.com>");
        assert_eq!(message.stripped_html, None);
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(
            message.attachments[0].source,
            AttachmentSource::Remote("https://mg.test/a1".into())
        );
        assert_eq!(
            message.content_ids.get("img1").map(String::as_str),
            Some("https://mg.test/a1")
        );
    }

    #[test]
    fn test_parse_mailgun_reply_to_wins() {
        let mut form = form();
        form.message_headers = Some(
            r#"[["Message-Id", "<m2@y.com>"], ["Reply-To", "Team <team@y.com>"]]"#.into(),
        );
        let message = parse_mailgun(form).unwrap();
        assert_eq!(message.sender, "team@y.com");
        assert_eq!(message.thread_key(), "m2@y.com");
    }

    #[test]
    fn test_parse_mailgun_tolerates_bad_attachment_json() {
        let mut form = form();
        form.attachments = Some("[oops".into());
        form.content_id_map = Some("{".into());
        let message = parse_mailgun(form).unwrap();
        assert!(message.attachments.is_empty());
        assert!(message.content_ids.is_empty());
    }

    #[test]
    fn test_parse_mailgun_requires_headers() {
        let mut form = form();
        form.message_headers = None;
        assert!(matches!(parse_mailgun(form), Err(BridgeError::Validation(_))));
    }
}
