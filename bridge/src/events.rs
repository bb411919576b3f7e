//! Board webhook events and their dispatch.
//!
//! Every event is classified into one [`Action`] first; only then does
//! anything touch the store, the board or the relay.

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::markup::{self, DescriptionParams};
use crate::reply::{self, Author, Reply, ReplyOutcome};
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoardEvent {
    #[serde(default)]
    pub action: EventAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAction {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id_member_creator: String,
    #[serde(default)]
    pub member_creator: Member,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub card: EventCard,
    /// Comment text on `commentCard`
    #[serde(default)]
    pub text: Option<String>,
    /// Edited comment on `updateComment`
    #[serde(default)]
    pub action: Option<CommentData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCard {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub short_link: String,
    #[serde(default)]
    pub desc: Option<String>,
}

impl EventCard {
    fn key(&self) -> &str {
        if self.id.is_empty() {
            &self.short_link
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
}

/// What to do with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Reply),
    RemoveCard(String),
    UpdateThread {
        card: String,
        params: DescriptionParams,
    },
    Drop(&'static str),
}

impl Action {
    fn label(&self) -> &'static str {
        match self {
            Action::Send(_) => "send",
            Action::RemoveCard(_) => "remove_card",
            Action::UpdateThread { .. } => "update_thread",
            Action::Drop(_) => "drop",
        }
    }
}

/// Classify an event. Pure; no I/O.
pub fn classify(event: &BoardEvent, config: &Config) -> Action {
    let action = &event.action;
    let author_id = if action.member_creator.id.is_empty() {
        &action.id_member_creator
    } else {
        &action.member_creator.id
    };
    if !config.trello_bot_id.is_empty() && *author_id == config.trello_bot_id {
        return Action::Drop("bot_author");
    }

    let card = action.data.card.key().to_string();
    if card.is_empty() {
        return Action::Drop("no_card");
    }
    let author = Author {
        id: author_id.clone(),
        full_name: action.member_creator.full_name.clone(),
        username: action.member_creator.username.clone(),
    };
    let send = |comment_id: &str, text: &str| match markup::strip_marker(text, &config.marker_prefixes)
    {
        Some(stripped) if !comment_id.is_empty() => Action::Send(Reply {
            card: card.clone(),
            comment_id: comment_id.to_string(),
            text: stripped.to_string(),
            author: author.clone(),
        }),
        Some(_) => Action::Drop("no_comment_id"),
        None => Action::Drop("no_marker"),
    };

    match action.kind.as_str() {
        "commentCard" => send(
            action.id.as_str(),
            action.data.text.as_deref().unwrap_or_default(),
        ),
        "updateComment" => match &action.data.action {
            Some(comment) => {
                let id = if comment.id.is_empty() {
                    &action.id
                } else {
                    &comment.id
                };
                send(id.as_str(), comment.text.as_str())
            }
            None => Action::Drop("no_comment"),
        },
        "deleteCard" => Action::RemoveCard(card.clone()),
        "updateCard" => match action
            .data
            .card
            .desc
            .as_deref()
            .and_then(markup::parse_description)
        {
            Some(params) => Action::UpdateThread {
                card: card.clone(),
                params,
            },
            None => Action::Drop("no_thread_params"),
        },
        _ => Action::Drop("ignored_type"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Sent { message_id: String },
    AlreadySent,
    CardRemoved,
    ThreadUpdated,
    Dropped(&'static str),
}

/// Classify and carry out a board event.
pub async fn handle(state: &AppState, event: &BoardEvent) -> Result<EventOutcome> {
    let action = classify(event, &state.config);
    info!(
        kind = %event.action.kind,
        card = %event.action.data.card.short_link,
        action = action.label(),
        "board_event"
    );

    match action {
        Action::Send(reply) => Ok(match reply::send_reply(state, &reply).await? {
            ReplyOutcome::Sent { message_id } => EventOutcome::Sent { message_id },
            ReplyOutcome::AlreadySent => EventOutcome::AlreadySent,
        }),
        Action::RemoveCard(card) => {
            let removed = state.store.remove_card(&card)?;
            info!(card = %card, removed, "board_event_card_removed");
            Ok(EventOutcome::CardRemoved)
        }
        Action::UpdateThread { card, params } => update_thread(state, &card, &params).await,
        Action::Drop(reason) => {
            info!(kind = %event.action.kind, reason, "board_event_dropped");
            Ok(EventOutcome::Dropped(reason))
        }
    }
}

/// Apply subject and recipients edited into the card description.
async fn update_thread(
    state: &AppState,
    card: &str,
    params: &DescriptionParams,
) -> Result<EventOutcome> {
    let recipients = params.recipients();
    if recipients.is_empty() {
        warn!(card = %card, reply_to = %params.reply_to, "board_event_no_recipients");
        return Ok(EventOutcome::Dropped("no_recipients"));
    }

    match state
        .store
        .set_thread_override(card, &params.subject, &recipients)
    {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => {
            info!(card = %card, "board_event_unknown_card");
            return Ok(EventOutcome::Dropped("unknown_card"));
        }
        Err(e) => return Err(e.into()),
    }

    let notice = format!(
        "All comments from now on will be sent to **{}** with the subject _{}_.",
        recipients.join(", "),
        params.subject
    );
    if let Err(e) = state.board.add_comment(card, &notice).await {
        warn!(card = %card, error = %e, "board_event_notice_failed");
    }
    info!(card = %card, subject = %params.subject, "board_event_thread_updated");
    Ok(EventOutcome::ThreadUpdated)
}
