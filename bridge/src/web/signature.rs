//! Webhook authentication.
//!
//! Mailgun signs webhook requests using HMAC-SHA256.
//! Reference: https://documentation.mailgun.com/docs/mailgun/user-manual/events/webhooks/#securing-webhooks
//!
//! The raw MIME endpoint and the address API use shared secrets instead.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing signature fields")]
    MissingFields,

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("timestamp is {age}s old")]
    Stale { age: u64 },

    #[error("signature mismatch")]
    Mismatch,

    #[error("missing credentials")]
    MissingSecret,
}

/// The three signature fields Mailgun adds to every webhook post.
#[derive(Debug, Clone, Copy)]
pub struct MailgunSignature<'a> {
    /// Unix epoch seconds when the webhook was generated
    pub timestamp: &'a str,
    pub token: &'a str,
    /// Hex HMAC-SHA256 of `timestamp + token`
    pub signature: &'a str,
}

impl MailgunSignature<'_> {
    /// Check against `signing_key`, rejecting timestamps further than
    /// `max_age` seconds from now in either direction.
    pub fn verify(&self, signing_key: &str, max_age: u64) -> Result<(), AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.verify_at(signing_key, max_age, now)
    }

    fn verify_at(&self, signing_key: &str, max_age: u64, now: u64) -> Result<(), AuthError> {
        if signing_key.is_empty()
            || self.timestamp.is_empty()
            || self.token.is_empty()
            || self.signature.is_empty()
        {
            return Err(AuthError::MissingFields);
        }

        let sent: u64 = self
            .timestamp
            .parse()
            .map_err(|_| AuthError::InvalidTimestamp(self.timestamp.to_string()))?;
        let age = now.abs_diff(sent);
        if age > max_age {
            return Err(AuthError::Stale { age });
        }

        let provided = hex::decode(self.signature).map_err(|_| AuthError::Mismatch)?;
        let mut mac =
            HmacSha256::new_from_slice(signing_key.as_bytes()).map_err(|_| AuthError::Mismatch)?;
        mac.update(self.timestamp.as_bytes());
        mac.update(self.token.as_bytes());
        mac.verify_slice(&provided).map_err(|_| AuthError::Mismatch)
    }
}

/// The configured signing key, when verification is switched on.
pub fn signing_key(configured: &Option<String>) -> Option<&str> {
    configured.as_deref().map(str::trim).filter(|k| !k.is_empty())
}

/// Compare a presented shared secret with the expected one in constant time.
pub fn check_secret(provided: Option<&str>, expected: &str) -> Result<(), AuthError> {
    let provided = provided.ok_or(AuthError::MissingSecret)?;
    if provided.len() != expected.len() {
        return Err(AuthError::Mismatch);
    }
    let diff = provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(AuthError::Mismatch)
    }
}

#[cfg(test)]
pub(crate) fn sign(signing_key: &str, timestamp: &str, token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).unwrap();
    mac.update(format!("{timestamp}{token}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
