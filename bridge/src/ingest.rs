//! Mail ingestion: turns an inbound message into a card comment.
//!
//! ```text
//! route → resolve thread → revive | create card → attachments → comment → record
//! ```
//!
//! Only routing and the steps before the board card exists can fail the
//! request. Once a card has been created or revived, later failures are
//! logged and the message is still acknowledged, so the relay does not
//! redeliver it and spawn another card.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::board::{Card, NewCard, Upload};
use crate::error::{BridgeError, Result};
use crate::inbound::{AttachmentSource, InboundAttachment, InboundMessage};
use crate::markup::{self, DescriptionParams};
use crate::state::AppState;
use crate::store::{AddressSettings, CardRef};
use crate::thread;

/// Attachments of this size or larger are skipped.
pub const MAX_ATTACHMENT_SIZE: u64 = 100_000_000;

/// Longest file name used for the uploaded message body, extension excluded.
const BODY_NAME_LEN: usize = 79;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new card was created for the message
    Created(CardRef),
    /// The message continued an existing card
    Continued(CardRef),
    /// The card already held this message; only the sender was refreshed
    Duplicate(CardRef),
}

impl IngestOutcome {
    pub fn card(&self) -> &CardRef {
        match self {
            IngestOutcome::Created(card)
            | IngestOutcome::Continued(card)
            | IngestOutcome::Duplicate(card) => card,
        }
    }
}

/// Ingest one inbound message.
pub async fn ingest(state: &AppState, message: &InboundMessage) -> Result<IngestOutcome> {
    let store = &state.store;

    let list_id = store
        .target_list(&message.recipient)?
        .ok_or_else(|| BridgeError::Unrouted(message.recipient.clone()))?;
    let settings = store
        .receiving_settings(&message.recipient)?
        .unwrap_or_default();

    info!(
        recipient = %message.recipient,
        sender = %message.sender,
        message_id = %message.message_id,
        "ingest_start"
    );

    let resolved = thread::resolve(
        store,
        message.thread_key(),
        &message.subject,
        &message.sender,
        &message.recipient,
        Utc::now(),
    )?;

    let existing = match resolved {
        Some(card_ref) => continue_card(state, message, &settings, card_ref).await?,
        None => None,
    };

    let (card, created) = match existing {
        Some(Existing::Duplicate(card_ref)) => return Ok(IngestOutcome::Duplicate(card_ref)),
        Some(Existing::Card(card)) => (card, false),
        None => (create_card(state, message, &list_id).await?, true),
    };
    let card_ref = CardRef {
        short_link: card.short_link.clone(),
        id: card.id.clone(),
    };

    // The card exists on the board from here on.
    let uploaded = upload_attachments(state, &card, &message.attachments).await;
    let comment = post_message(state, message, &card, &uploaded).await;

    if created && settings.message_in_desc {
        if let Some(text) = &comment.text {
            let desc = format!("{}\n\n{}", card.desc, text);
            if let Err(e) = state.board.set_description(&card.id, &desc).await {
                warn!(card = %card.short_link, error = %e, "ingest_description_update_failed");
            }
        }
    }

    if let Err(e) = store.record_received(
        &card.id,
        &card.short_link,
        &message.message_id,
        &message.subject,
        &message.sender,
        comment.id.as_deref().unwrap_or_default(),
        Utc::now(),
    ) {
        error!(
            card = %card.short_link,
            message_id = %message.message_id,
            comment_id = ?comment.id,
            error = %e,
            "ingest_record_failed"
        );
    }

    info!(
        card = %card.short_link,
        message_id = %message.message_id,
        created,
        attachments = uploaded.len(),
        "ingest_complete"
    );

    Ok(if created {
        IngestOutcome::Created(card_ref)
    } else {
        IngestOutcome::Continued(card_ref)
    })
}

enum Existing {
    Card(Card),
    Duplicate(CardRef),
}

/// Bring a resolved card back into view. `None` when the board lost it and
/// a new card has to be created.
async fn continue_card(
    state: &AppState,
    message: &InboundMessage,
    settings: &AddressSettings,
    card_ref: CardRef,
) -> Result<Option<Existing>> {
    let card = match state.board.card(&card_ref.id).await {
        Ok(card) => card,
        Err(e) if e.is_not_found() => {
            warn!(card = %card_ref.short_link, "ingest_card_gone_upstream");
            state.store.remove_card(&card_ref.short_link)?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if state
        .store
        .card_has_mail(&card.short_link, &message.message_id)?
    {
        info!(
            card = %card.short_link,
            message_id = %message.message_id,
            "ingest_duplicate_delivery"
        );
        state.store.record_received(
            &card.id,
            &card.short_link,
            &message.message_id,
            &message.subject,
            &message.sender,
            "",
            Utc::now(),
        )?;
        return Ok(Some(Existing::Duplicate(card_ref)));
    }

    if let Err(e) = state.board.revive_card(&card.id).await {
        warn!(card = %card.short_link, error = %e, "ingest_revive_failed");
    }
    if settings.move_to_top {
        if let Err(e) = state.board.move_to_top(&card.id).await {
            warn!(card = %card.short_link, error = %e, "ingest_move_to_top_failed");
        }
    }
    info!(card = %card.short_link, "ingest_card_revived");
    Ok(Some(Existing::Card(card)))
}

/// Create the card, its webhook and the local record. On failure after the
/// board card exists, the card and webhook are deleted again.
async fn create_card(state: &AppState, message: &InboundMessage, list_id: &str) -> Result<Card> {
    let params = DescriptionParams {
        to: message.to.clone(),
        recipient: message.recipient.clone(),
        from: message.from.clone(),
        reply_to: message.sender.clone(),
        subject: message.subject.clone(),
    };
    let new_card = NewCard {
        list_id: list_id.to_string(),
        name: markup::card_name(&message.sender, &message.subject),
        desc: markup::card_description(&params),
        member_ids: Vec::new(),
    };

    let card = state.board.create_card(&new_card).await?;

    let webhook_id = match state
        .board
        .create_webhook(&card.id, &state.config.card_webhook_url())
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!(card = %card.short_link, error = %e, "ingest_webhook_failed");
            discard_card(state, &card, None).await;
            return Err(e.into());
        }
    };

    if let Err(e) = state.store.save_card(
        &message.recipient,
        &card.short_link,
        &card.id,
        &webhook_id,
    ) {
        error!(card = %card.short_link, error = %e, "ingest_save_card_failed");
        discard_card(state, &card, Some(&webhook_id)).await;
        return Err(e.into());
    }

    info!(card = %card.short_link, list = %list_id, "ingest_card_created");
    Ok(card)
}

/// Best-effort removal of a half-created card.
async fn discard_card(state: &AppState, card: &Card, webhook_id: Option<&str>) {
    if let Some(webhook_id) = webhook_id {
        if let Err(e) = state.board.delete_webhook(webhook_id).await {
            error!(webhook = %webhook_id, error = %e, "ingest_discard_webhook_failed");
        }
    }
    match state.board.delete_card(&card.id).await {
        Ok(()) => info!(card = %card.short_link, "ingest_card_discarded"),
        Err(e) => error!(card = %card.short_link, error = %e, "ingest_discard_card_failed"),
    }
}

/// Upload attachments below the size ceiling, skipping content this card
/// already holds. Returns attachment reference to board URL.
async fn upload_attachments(
    state: &AppState,
    card: &Card,
    attachments: &[InboundAttachment],
) -> HashMap<String, String> {
    let mut uploaded = HashMap::new();
    let mut cache = state.cache.scope(&card.id);

    for attachment in attachments {
        if attachment.size >= MAX_ATTACHMENT_SIZE {
            warn!(
                card = %card.short_link,
                name = %attachment.name,
                size = attachment.size,
                "ingest_attachment_too_large"
            );
            continue;
        }

        let bytes = match &attachment.source {
            AttachmentSource::Inline(bytes) => bytes.clone(),
            AttachmentSource::Remote(url) => match state.relay.fetch(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(card = %card.short_link, url = %url, error = %e, "ingest_attachment_download_failed");
                    continue;
                }
            },
        };

        if cache.has(&bytes).await {
            if let Some(url) = cache.current_url() {
                uploaded.insert(attachment.reference.clone(), url.to_string());
                continue;
            }
        }

        let upload = Upload {
            name: attachment.name.clone(),
            mime: attachment.content_type.clone(),
            bytes,
        };
        match state.board.attach(&card.id, upload).await {
            Ok(remote) => {
                cache.save(&remote.url).await;
                uploaded.insert(attachment.reference.clone(), remote.url);
            }
            Err(e) => {
                warn!(card = %card.short_link, name = %attachment.name, error = %e, "ingest_attachment_upload_failed");
            }
        }
    }

    uploaded
}

struct PostedComment {
    id: Option<String>,
    text: Option<String>,
}

/// Attach the full body and post the quoted message as a comment.
async fn post_message(
    state: &AppState,
    message: &InboundMessage,
    card: &Card,
    uploaded: &HashMap<String, String>,
) -> PostedComment {
    let mut cid_urls = HashMap::new();
    for (cid, reference) in &message.content_ids {
        match uploaded.get(reference) {
            Some(url) => {
                cid_urls.insert(cid.clone(), url.clone());
            }
            None => warn!(card = %card.short_link, cid = %cid, "ingest_cid_without_upload"),
        }
    }

    let base_name: String = message.sender.chars().take(BODY_NAME_LEN).collect();
    let (body, name, mime) = match &message.body_html {
        Some(html) => (
            markup::rewrite_content_ids(html, &cid_urls),
            format!("{base_name}.html"),
            "text/html",
        ),
        None => (
            message.body_plain.clone(),
            format!("{base_name}.txt"),
            "text/plain",
        ),
    };
    let body_url = match state
        .board
        .attach(
            &card.id,
            Upload {
                name,
                mime: mime.to_string(),
                bytes: body.into_bytes(),
            },
        )
        .await
    {
        Ok(attachment) => attachment.url,
        Err(e) => {
            warn!(card = %card.short_link, error = %e, "ingest_body_upload_failed");
            String::new()
        }
    };

    let quoted_html = message
        .stripped_html
        .as_deref()
        .or(message.body_html.as_deref())
        .map(|html| markup::html_to_markup(&markup::rewrite_content_ids(html, &cid_urls)))
        .unwrap_or_default();
    let text = if quoted_html.is_empty() {
        message
            .stripped_text
            .clone()
            .unwrap_or_else(|| message.body_plain.trim().to_string())
    } else {
        quoted_html
    };

    let comment = markup::compose_comment(&body_url, &message.sender, &text);
    match state.board.add_comment(&card.id, &comment).await {
        Ok(posted) => PostedComment {
            id: Some(posted.id),
            text: Some(comment),
        },
        Err(e) => {
            error!(
                card = %card.short_link,
                message_id = %message.message_id,
                error = %e,
                "ingest_comment_failed"
            );
            PostedComment { id: None, text: None }
        }
    }
}
