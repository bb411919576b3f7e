//! Reply pipeline: a marked card comment becomes an email to the thread.
//!
//! Delivery results arrive later through the relay's callbacks, handled by
//! [`delivered`] and [`failed`].

use chrono::Utc;
use tracing::{error, info, warn};

use crate::address::{domain_of, is_email};
use crate::error::{BridgeError, Result};
use crate::markup;
use crate::relay::{domain_capabilities, OutboundMessage, Tracking};
use crate::state::AppState;
use crate::store::ThreadParams;
use crate::subject;

/// Posted on a card whose comments cannot be routed to any thread.
pub const UNKNOWN_THREAD_NOTICE: &str =
    "Due to an unexpected error, replies on this card can't be sent. Please report this issue.";

/// Who wrote the comment being sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub full_name: String,
    pub username: String,
}

/// A marked comment, marker already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Card id or short link
    pub card: String,
    pub comment_id: String,
    pub text: String,
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Sent { message_id: String },
    /// The comment had already been turned into a mail
    AlreadySent,
}

/// Sending identity for one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    from: String,
    reply_to: String,
}

/// Pick the From and Reply-To addresses for a thread.
///
/// A delegated outbound is used only while its domain can send; its address
/// becomes the Reply-To only when it can also receive. Self-sending threads
/// honor the configured Reply-To when it is a valid address.
async fn choose_identity(state: &AppState, params: &ThreadParams) -> Identity {
    let inbound = params.inbound.clone();

    if params.outbound != params.inbound {
        if let Some(domain) = domain_of(&params.outbound) {
            let caps =
                domain_capabilities(state.relay.as_ref(), &state.config.base_domain, &domain)
                    .await;
            info!(
                outbound = %params.outbound,
                can_send = caps.can_send,
                can_receive = caps.can_receive,
                "reply_outbound_checked"
            );
            if caps.can_send {
                let reply_to = if caps.can_receive {
                    params.outbound.clone()
                } else {
                    inbound.clone()
                };
                return Identity {
                    from: params.outbound.clone(),
                    reply_to,
                };
            }
        }
        warn!(outbound = %params.outbound, inbound = %inbound, "reply_outbound_unusable");
        return Identity {
            from: inbound.clone(),
            reply_to: inbound,
        };
    }

    let reply_to = params
        .reply_to
        .clone()
        .filter(|r| is_email(r))
        .unwrap_or_else(|| inbound.clone());
    Identity {
        from: inbound,
        reply_to,
    }
}

/// Send a marked comment as a reply on its card's thread.
pub async fn send_reply(state: &AppState, reply: &Reply) -> Result<ReplyOutcome> {
    if let Some(mail) = state.store.mail_for_comment(&reply.comment_id)? {
        info!(
            card = %reply.card,
            comment = %reply.comment_id,
            message_id = %mail.id,
            "reply_already_sent"
        );
        return Ok(ReplyOutcome::AlreadySent);
    }

    let Some(params) = state.store.thread_params(&reply.card)? else {
        warn!(card = %reply.card, comment = %reply.comment_id, "reply_unknown_thread");
        if let Err(e) = state
            .board
            .add_comment(&reply.card, UNKNOWN_THREAD_NOTICE)
            .await
        {
            warn!(card = %reply.card, error = %e, "reply_notice_failed");
        }
        return Err(BridgeError::NotFound(format!("thread for card {}", reply.card)));
    };

    if params.recipients.is_empty() {
        return Err(BridgeError::Validation(format!(
            "card {} has no recipients",
            params.card_short_link
        )));
    }

    let identity = choose_identity(state, &params).await;
    let domain = domain_of(&identity.from)
        .ok_or_else(|| BridgeError::Validation(format!("bad sending address {}", identity.from)))?;

    let mut text = reply.text.clone();
    if let Some(template) = params.signature_template.as_deref().filter(|t| !t.is_empty()) {
        if let Some(signature) =
            markup::render_signature(template, &reply.author.full_name, &reply.author.username)
        {
            text = format!("{text}\n\n{signature}");
        }
    }

    let message = OutboundMessage {
        from: identity.from.clone(),
        from_name: params.sender_name.clone(),
        to: params.recipients.clone(),
        subject: subject::normalize(&params.last_mail_subject),
        html: Some(markup::text_to_html(&text)),
        text,
        reply_to: Some(identity.reply_to.clone()),
        in_reply_to: Some(params.last_mail_id.clone()),
        tracking: Some(Tracking {
            card: params.card_id.clone(),
            commenter: reply.author.id.clone(),
        }),
    };

    info!(
        card = %params.card_short_link,
        from = %identity.from,
        reply_to = %identity.reply_to,
        recipients = ?params.recipients,
        "reply_sending"
    );

    let message_id = state.relay.send(&domain, &message).await?;

    // The mail is out; a failure to record it must not make the board retry.
    if let Err(e) = state.store.record_sent(
        &params.card_short_link,
        &reply.author.id,
        &message_id,
        &reply.comment_id,
        Utc::now(),
    ) {
        error!(
            card = %params.card_short_link,
            comment = %reply.comment_id,
            message_id = %message_id,
            error = %e,
            "reply_record_failed"
        );
    }

    info!(card = %params.card_short_link, message_id = %message_id, "reply_sent");
    Ok(ReplyOutcome::Sent { message_id })
}

/// Delivery succeeded: add the commenter to the card when the address asks
/// for it.
pub async fn delivered(state: &AppState, card: &str, commenter: &str) -> Result<()> {
    let address = state
        .store
        .card_address(card)?
        .ok_or_else(|| BridgeError::NotFound(format!("card {card}")))?;
    let settings = state
        .store
        .receiving_settings(&address)?
        .unwrap_or_default();

    if !settings.add_replier || commenter.is_empty() {
        return Ok(());
    }
    match state.board.add_member(card, commenter).await {
        Ok(()) => info!(card = %card, member = %commenter, "reply_replier_added"),
        Err(e) => warn!(card = %card, member = %commenter, error = %e, "reply_add_member_failed"),
    }
    Ok(())
}

/// Delivery failed: leave a visible note on the card.
pub async fn failed(state: &AppState, card: &str, recipient: &str, description: &str) -> Result<()> {
    warn!(card = %card, recipient = %recipient, reason = %description, "reply_delivery_failed");
    let text = format!("**mail could not be delivered to {recipient}**\n\n---\n\n{description}");
    if let Err(e) = state.board.add_comment(card, &text).await {
        warn!(card = %card, error = %e, "reply_failure_notice_failed");
    }
    Ok(())
}
