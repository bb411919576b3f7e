//! Cloudflare Email Worker payloads.
//!
//! The worker forwards the raw RFC 5322 message, so everything Mailgun would
//! have pre-parsed (bodies, attachments, content ids) is extracted here with
//! `mailparse`.

use std::collections::HashMap;

use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use serde::Deserialize;
use tracing::{info, warn};

use super::{AttachmentSource, Envelope, InboundAttachment, InboundMessage};
use crate::address::normalize_message_id;
use crate::error::BridgeError;

/// Raw Cloudflare webhook payload (JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct CloudflarePayload {
    /// Sender email address
    #[serde(rename = "from")]
    pub from_field: String,
    /// Recipient email address
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub timestamp: String,
    /// Raw RFC 5322 email content (headers + body)
    pub raw_content: String,
}

#[derive(Default)]
struct Parts {
    plain: Vec<String>,
    html: Vec<String>,
    attachments: Vec<InboundAttachment>,
    content_ids: HashMap<String, String>,
}

/// Build an [`InboundMessage`] from a raw MIME payload.
pub fn parse_cloudflare(payload: CloudflarePayload) -> Result<InboundMessage, BridgeError> {
    info!(
        from = %payload.from_field,
        to = %payload.to,
        raw_content_length = payload.raw_content.len(),
        "cloudflare_parse_start"
    );

    let mail = parse_mail(payload.raw_content.as_bytes()).map_err(|e| {
        warn!(error = %e, "cloudflare_email_parse_failed");
        BridgeError::Validation(format!("unparseable message: {e}"))
    })?;

    let header = |name: &str| {
        mail.headers
            .get_first_value(name)
            .filter(|v| !v.trim().is_empty())
    };
    let from = header("From").unwrap_or_else(|| payload.from_field.clone());
    let subject = header("Subject").unwrap_or_else(|| payload.subject.clone());
    let reply_to = header("Reply-To");
    let message_id = header("Message-Id");
    let in_reply_to = header("In-Reply-To");
    let to = header("To").unwrap_or_else(|| payload.to.clone());

    let (recipient, sender, message_id, in_reply_to) = Envelope {
        recipient: &payload.to,
        from: &from,
        reply_to: reply_to.as_deref(),
        message_id: message_id.as_deref(),
        in_reply_to: in_reply_to.as_deref(),
        subject: &subject,
    }
    .identity();

    let mut parts = Parts::default();
    collect_parts(&mail, &mut parts);

    let message = InboundMessage {
        recipient,
        from,
        to,
        sender,
        subject,
        message_id,
        in_reply_to,
        body_plain: parts.plain.join("\n"),
        body_html: (!parts.html.is_empty()).then(|| parts.html.join("\n")),
        stripped_text: None,
        stripped_html: None,
        attachments: parts.attachments,
        content_ids: parts.content_ids,
    };

    info!(
        message_id = %message.message_id,
        has_html = message.body_html.is_some(),
        attachments = message.attachments.len(),
        "cloudflare_parse_complete"
    );

    Ok(message)
}

/// Walk the MIME tree, sorting leaves into bodies and attachments.
fn collect_parts(part: &ParsedMail, out: &mut Parts) {
    if part.ctype.mimetype.starts_with("multipart/") {
        for sub in &part.subparts {
            collect_parts(sub, out);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let content_id = part
        .headers
        .get_first_value("Content-Id")
        .map(|id| normalize_message_id(&id))
        .filter(|id| !id.is_empty());

    let is_body = filename.is_none()
        && content_id.is_none()
        && !matches!(disposition.disposition, DispositionType::Attachment)
        && matches!(part.ctype.mimetype.as_str(), "text/plain" | "text/html");

    if is_body {
        match part.get_body() {
            Ok(body) if !body.trim().is_empty() => {
                if part.ctype.mimetype == "text/html" {
                    out.html.push(body);
                } else {
                    out.plain.push(body);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "email_body_extraction_failed"),
        }
        return;
    }

    let bytes = match part.get_body_raw() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, mimetype = %part.ctype.mimetype, "email_attachment_decode_failed");
            return;
        }
    };

    let index = out.attachments.len();
    let reference = format!("part-{index}");
    let name = filename.unwrap_or_else(|| match &content_id {
        Some(cid) => cid.clone(),
        None => format!("attachment-{index}"),
    });
    if let Some(cid) = content_id {
        out.content_ids.insert(cid, reference.clone());
    }
    out.attachments.push(InboundAttachment {
        reference,
        name,
        content_type: part.ctype.mimetype.clone(),
        size: bytes.len() as u64,
        source: AttachmentSource::Inline(bytes),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: &str) -> CloudflarePayload {
        CloudflarePayload {
            from_field: "c@y.com".to_string(),
            to: "Support@BoardThreads.com".to_string(),
            subject: "Fallback".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            raw_content: raw.to_string(),
        }
    }

    #[test]
    fn test_parse_cloudflare_simple_html() {
        let raw = "From: Cliente <c@y.com>\r\nMessage-Id: <test123@example.com>\r\nSubject: Help\r\nContent-Type: text/html\r\n\r\n<html><body>Hello World</body></html>";

        let message = parse_cloudflare(payload(raw)).unwrap();

        assert_eq!(message.recipient, "support@boardthreads.com");
        assert_eq!(message.sender, "c@y.com");
        assert_eq!(message.message_id, "test123@example.com");
        assert_eq!(message.subject, "Help");
        assert!(message.body_html.unwrap().contains("Hello World"));
        assert!(message.body_plain.is_empty());
    }

    #[test]
    fn test_parse_cloudflare_fallback_message_id() {
        let raw = "Content-Type: text/plain\r\n\r\nhello";

        let message = parse_cloudflare(payload(raw)).unwrap();

        assert_eq!(message.subject, "Fallback");
        assert_eq!(message.message_id.len(), 64);
        assert_eq!(message.body_plain, "hello");
        assert_eq!(message.body_html, None);
    }

    #[test]
    fn test_parse_cloudflare_multipart_with_inline_image() {
        let raw = concat!(
            "From: c@y.com\r\n",
            "Message-Id: <multi@y.com>\r\n",
            "In-Reply-To: <first@y.com>\r\n",
            "Subject: Re: Help\r\n",
            "Content-Type: multipart/related; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Plain version\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>HTML <img src=\"cid:logo@y\"></p>\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: image/png; name=\"logo.png\"\r\n",
            "Content-Id: <logo@y>\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "aGVsbG8=\r\n",
            "--outer--\r\n",
        );

        let message = parse_cloudflare(payload(raw)).unwrap();

        assert_eq!(message.thread_key(), "first@y.com");
        assert!(message.body_plain.contains("Plain version"));
        assert!(message.body_html.as_deref().unwrap().contains("cid:logo@y"));
        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.name, "logo.png");
        assert_eq!(attachment.content_type, "image/png");
        assert_eq!(attachment.source, AttachmentSource::Inline(b"hello".to_vec()));
        assert_eq!(
            message.content_ids.get("logo@y").map(String::as_str),
            Some(attachment.reference.as_str())
        );
    }

    #[test]
    fn test_parse_cloudflare_attachment_disposition() {
        let raw = concat!(
            "From: c@y.com\r\n",
            "Message-Id: <att@y.com>\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n",
            "\r\n",
            "file body\r\n",
            "--b--\r\n",
        );

        let message = parse_cloudflare(payload(raw)).unwrap();

        assert!(message.body_plain.contains("see attached"));
        assert!(!message.body_plain.contains("file body"));
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].name, "notes.txt");
        assert!(message.content_ids.is_empty());
    }
}
