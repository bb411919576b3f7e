//! Thread resolution: which existing card, if any, an inbound message continues.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::address::normalize_address;
use crate::store::{CardRef, Store, StoreError};

/// Threads whose latest mail is older than this are never continued.
pub const THREAD_EXPIRY_DAYS: i64 = 15;

/// Find the card an inbound message belongs to.
///
/// A candidate matches on message id, or on normalized subject plus sender.
/// It is discarded when its latest mail is older than [`THREAD_EXPIRY_DAYS`]
/// or when its card belongs to another inbound address.
pub fn resolve(
    store: &Store,
    message_id: &str,
    raw_subject: &str,
    sender: &str,
    recipient: &str,
    now: DateTime<Utc>,
) -> Result<Option<CardRef>, StoreError> {
    let Some(candidate) = store.find_thread_candidate(message_id, raw_subject, sender)? else {
        return Ok(None);
    };

    if now - candidate.last > Duration::days(THREAD_EXPIRY_DAYS) {
        info!(
            card = %candidate.card.short_link,
            last = %candidate.last,
            "thread_expired"
        );
        return Ok(None);
    }

    if candidate.address != normalize_address(recipient) {
        info!(
            card = %candidate.card.short_link,
            card_address = %candidate.address,
            recipient = %recipient,
            "thread_recipient_mismatch"
        );
        return Ok(None);
    }

    Ok(Some(candidate.card))
}
