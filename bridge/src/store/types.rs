use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-address behavior switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressSettings {
    /// Reply-To header override for outbound mail
    pub reply_to: Option<String>,
    /// Display name on outbound mail
    pub sender_name: Option<String>,
    /// Add repliers as card members once their mail is delivered
    pub add_replier: bool,
    /// Copy the first message of a thread into the card description
    pub message_in_desc: bool,
    /// Move a revived card to the top of its list
    pub move_to_top: bool,
    /// Appended to outbound mail; supports `{NAME}` and `{USERNAME}`
    pub signature_template: Option<String>,
}

/// An inbound address as seen by its controlling user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub inbound: String,
    /// Equal to `inbound` while self-sending
    pub outbound: String,
    pub user_id: String,
    pub list_id: String,
    pub board_short_link: String,
    pub created_at: DateTime<Utc>,
    /// Custom domain, present only when delegated to a domain this user owns
    pub domain: Option<String>,
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_profile_id: Option<String>,
    pub settings: AddressSettings,
}

impl Address {
    pub fn is_delegated(&self) -> bool {
        self.outbound != self.inbound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAddressOutcome {
    Created,
    /// Existing address moved to another list; sending configuration kept
    Repointed,
    /// Another user controls the address; nothing changed
    Forbidden,
}

/// Outbound identity of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    SelfSending,
    Delegated {
        outbound: String,
        domain: String,
        route_id: Option<String>,
    },
}

impl Binding {
    pub fn outbound(&self) -> Option<&str> {
        match self {
            Binding::SelfSending => None,
            Binding::Delegated { outbound, .. } => Some(outbound),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Binding::SelfSending => None,
            Binding::Delegated { domain, .. } => Some(domain),
        }
    }
}

/// Result of an outbound re-point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChange {
    pub previous: Binding,
    pub applied: Binding,
    /// Set when the target domain belongs to someone else
    pub denied_owner: Option<String>,
}

impl OutboundChange {
    /// True when the address now sends through a different identity.
    pub fn changed(&self) -> bool {
        self.previous.outbound() != self.applied.outbound()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRef {
    pub short_link: String,
    pub id: String,
}

/// Latest mail matching a thread lookup, with the card it sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCandidate {
    pub card: CardRef,
    pub address: String,
    pub last: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    pub id: String,
    pub date: DateTime<Utc>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub comment_id: Option<String>,
}

/// Everything the reply pipeline needs to answer on a card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadParams {
    pub card_short_link: String,
    pub card_id: String,
    pub last_mail_id: String,
    pub last_mail_subject: String,
    pub inbound: String,
    pub outbound: String,
    pub recipients: Vec<String>,
    pub reply_to: Option<String>,
    pub sender_name: Option<String>,
    pub signature_template: Option<String>,
    pub add_replier: bool,
}
