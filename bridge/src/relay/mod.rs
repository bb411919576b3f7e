//! Mail relay: sends outbound mail and hosts custom sending domains.

pub mod dns;
pub mod mailgun;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub use dns::{Capabilities, DnsRecord, DnsSummary};
pub use mailgun::MailgunClient;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} not found on the relay")]
    NotFound(String),

    #[error("relay API error {status}: {body}")]
    Status { status: u16, body: String },

    /// Attachment URL outside the relay's hosts; credentials are not sent there
    #[error("refusing to fetch {0}")]
    Untrusted(String),
}

/// Identifies the card and comment author behind an outbound message; echoed
/// back by the relay in delivery callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracking {
    pub card: String,
    pub commenter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub reply_to: Option<String>,
    pub in_reply_to: Option<String>,
    /// Set on replies; also turns open and click tracking off
    pub tracking: Option<Tracking>,
}

impl OutboundMessage {
    /// `From` header value with the display name when present.
    pub fn from_header(&self) -> String {
        match self.from_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.from),
            _ => self.from.clone(),
        }
    }
}

#[async_trait]
pub trait MailRelay: Send + Sync {
    /// Send through `domain`. Returns the relay's message id.
    async fn send(&self, domain: &str, message: &OutboundMessage) -> Result<String, RelayError>;

    /// DNS records the relay expects for `domain`, with their validation state.
    async fn domain_records(&self, domain: &str) -> Result<Vec<DnsRecord>, RelayError>;

    async fn create_domain(&self, domain: &str) -> Result<(), RelayError>;

    async fn delete_domain(&self, domain: &str) -> Result<(), RelayError>;

    /// Forward mail for `outbound` to `inbound`. Returns the route id.
    async fn create_route(&self, outbound: &str, inbound: &str) -> Result<String, RelayError>;

    async fn delete_route(&self, route_id: &str) -> Result<(), RelayError>;

    /// Register a delivery event webhook (`delivered`, `permanent_fail`).
    async fn create_webhook(&self, domain: &str, event: &str, url: &str)
        -> Result<(), RelayError>;

    /// Download a stored attachment.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RelayError>;
}

/// Whether `domain` can currently send and receive through the relay.
///
/// The base domain is always trusted. A failed lookup means neither.
pub async fn domain_capabilities(
    relay: &dyn MailRelay,
    base_domain: &str,
    domain: &str,
) -> Capabilities {
    if domain.eq_ignore_ascii_case(base_domain) {
        return Capabilities {
            can_send: true,
            can_receive: true,
        };
    }
    match relay.domain_records(domain).await {
        Ok(records) => DnsSummary::extract(domain, &records).capabilities(),
        Err(e) => {
            warn!(domain = %domain, error = %e, "relay_domain_lookup_failed");
            Capabilities::default()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRelay;
    use super::*;

    #[test]
    fn test_from_header() {
        let mut message = OutboundMessage {
            from: "help@biz.com".into(),
            ..Default::default()
        };
        assert_eq!(message.from_header(), "help@biz.com");
        message.from_name = Some("Biz Support".into());
        assert_eq!(message.from_header(), "Biz Support <help@biz.com>");
        message.from_name = Some("  ".into());
        assert_eq!(message.from_header(), "help@biz.com");
    }

    #[tokio::test]
    async fn test_base_domain_is_trusted_without_lookup() {
        let relay = FakeRelay::new();
        let caps = domain_capabilities(&relay, "boardthreads.com", "BoardThreads.com").await;
        assert!(caps.can_send && caps.can_receive);
    }

    #[tokio::test]
    async fn test_lookup_failure_means_no_capability() {
        let relay = FakeRelay::new();
        let caps = domain_capabilities(&relay, "boardthreads.com", "biz.com").await;
        assert_eq!(caps, Capabilities::default());
    }

    #[tokio::test]
    async fn test_verified_domain() {
        let relay = FakeRelay::new().with_verified_domain("biz.com");
        let caps = domain_capabilities(&relay, "boardthreads.com", "biz.com").await;
        assert!(caps.can_send);
        assert!(caps.can_receive);
    }
}
