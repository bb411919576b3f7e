//! Inbound message model, built from either inbound source.
//!
//! ```text
//! Mailgun form      ─┐
//!                    ├─→ InboundMessage ─→ ingest
//! Cloudflare MIME   ─┘
//! ```

pub mod cloudflare;
pub mod mailgun;

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::address::{normalize_address, normalize_message_id, parse_address};

pub use cloudflare::{parse_cloudflare, CloudflarePayload};
pub use mailgun::{parse_mailgun, MailgunForm};

/// Where an attachment's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// Stored by the relay; downloaded with relay credentials
    Remote(String),
    /// Decoded from the raw MIME message
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAttachment {
    /// Key used by the content-id map to refer to this attachment
    pub reference: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub source: AttachmentSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Inbound address the message was delivered to
    pub recipient: String,
    /// Raw `From` header
    pub from: String,
    /// Raw `To` header
    pub to: String,
    /// Address replies go to: `Reply-To` when present, else `From`
    pub sender: String,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub body_plain: String,
    pub body_html: Option<String>,
    pub stripped_text: Option<String>,
    pub stripped_html: Option<String>,
    pub attachments: Vec<InboundAttachment>,
    /// Content-Id (without brackets) to attachment reference
    pub content_ids: HashMap<String, String>,
}

impl InboundMessage {
    /// Key for thread lookup: the message this one answers, or itself.
    pub fn thread_key(&self) -> &str {
        self.in_reply_to
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.message_id)
    }
}

/// Header fields shared by both sources.
pub(crate) struct Envelope<'a> {
    pub recipient: &'a str,
    pub from: &'a str,
    pub reply_to: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    pub subject: &'a str,
}

impl Envelope<'_> {
    /// Normalized identity fields: (recipient, sender, message id, in-reply-to).
    pub(crate) fn identity(&self) -> (String, String, String, Option<String>) {
        let recipient = normalize_address(&parse_address(self.recipient));
        let sender = self
            .reply_to
            .map(parse_address)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| parse_address(self.from));
        let message_id = self
            .message_id
            .map(normalize_message_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| fallback_message_id(self.subject, self.from, &recipient));
        let in_reply_to = self
            .in_reply_to
            .map(normalize_message_id)
            .filter(|id| !id.is_empty());
        (recipient, normalize_address(&sender), message_id, in_reply_to)
    }
}

/// Stable Message-Id for mail that arrived without one.
fn fallback_message_id(subject: &str, from: &str, recipient: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}-{}", subject, from, recipient).as_bytes());
    let hash = hex::encode(hasher.finalize());

    info!(
        subject = %subject,
        recipient = %recipient,
        generated_id = %hash,
        "inbound_message_id_fallback"
    );

    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope<'a>(reply_to: Option<&'a str>, message_id: Option<&'a str>) -> Envelope<'a> {
        Envelope {
            recipient: "Support@BoardThreads.com",
            from: "Cliente <C@Y.com>",
            reply_to,
            message_id,
            in_reply_to: Some(" <prev@y.com> "),
            subject: "Help",
        }
    }

    #[test]
    fn test_identity_prefers_reply_to() {
        let (recipient, sender, id, in_reply_to) =
            envelope(Some("Other <other@z.com>"), Some("<m1@y.com>")).identity();
        assert_eq!(recipient, "support@boardthreads.com");
        assert_eq!(sender, "other@z.com");
        assert_eq!(id, "m1@y.com");
        assert_eq!(in_reply_to.as_deref(), Some("prev@y.com"));

        let (_, sender, _, _) = envelope(None, Some("<m1@y.com>")).identity();
        assert_eq!(sender, "c@y.com");
    }

    #[test]
    fn test_missing_message_id_gets_stable_fallback() {
        let (_, _, first, _) = envelope(None, None).identity();
        let (_, _, second, _) = envelope(None, Some("  ")).identity();
        assert_eq!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_thread_key_falls_back_to_own_id() {
        let mut message = InboundMessage {
            message_id: "m2".into(),
            in_reply_to: Some("m1".into()),
            ..Default::default()
        };
        assert_eq!(message.thread_key(), "m1");
        message.in_reply_to = None;
        assert_eq!(message.thread_key(), "m2");
    }
}
