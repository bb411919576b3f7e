//! Board provider: the task board cards and comments live on.

pub mod trello;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use trello::TrelloClient;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} not found on the board")]
    NotFound(String),

    #[error("board API error {status}: {body}")]
    Status { status: u16, body: String },
}

impl BoardError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BoardError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub short_link: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub id_list: String,
}

/// Card to be created on a list, at the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCard {
    pub list_id: String,
    pub name: String,
    pub desc: String,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Comment {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub url: String,
}

/// File to attach to a card.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BoardProvider: Send + Sync {
    /// Fetch a card by id or short link.
    async fn card(&self, card: &str) -> Result<Card, BoardError>;

    async fn create_card(&self, card: &NewCard) -> Result<Card, BoardError>;

    async fn delete_card(&self, card_id: &str) -> Result<(), BoardError>;

    /// Un-archive a card.
    async fn revive_card(&self, card_id: &str) -> Result<(), BoardError>;

    async fn move_to_top(&self, card_id: &str) -> Result<(), BoardError>;

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<Comment, BoardError>;

    async fn attach(&self, card_id: &str, upload: Upload) -> Result<Attachment, BoardError>;

    async fn set_description(&self, card_id: &str, desc: &str) -> Result<(), BoardError>;

    async fn add_member(&self, card_id: &str, member_id: &str) -> Result<(), BoardError>;

    /// Register a change webhook scoped to one model. Returns the webhook id.
    async fn create_webhook(&self, model_id: &str, callback_url: &str)
        -> Result<String, BoardError>;

    async fn delete_webhook(&self, webhook_id: &str) -> Result<(), BoardError>;
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeBoardState {
        /// Cards keyed by id
        pub cards: HashMap<String, Card>,
        /// (card id, text)
        pub comments: Vec<(String, String)>,
        /// (card id, file name, size)
        pub attachments: Vec<(String, String, usize)>,
        /// (card id, member id)
        pub members: Vec<(String, String)>,
        pub revived: Vec<String>,
        pub moved_to_top: Vec<String>,
        pub deleted_cards: Vec<String>,
        /// (webhook id, model id)
        pub webhooks: Vec<(String, String)>,
        pub deleted_webhooks: Vec<String>,
        pub fail_create_card: bool,
        pub fail_webhooks: bool,
        pub fail_comments: bool,
        pub fail_fetch: bool,
        next_id: u32,
    }

    /// In-memory board recording every call.
    #[derive(Debug, Default)]
    pub struct FakeBoard {
        pub state: Mutex<FakeBoardState>,
    }

    impl FakeBoard {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an existing card.
        pub fn with_card(self, id: &str, short_link: &str) -> Self {
            self.state.lock().cards.insert(
                id.to_string(),
                Card {
                    id: id.to_string(),
                    short_link: short_link.to_string(),
                    name: String::new(),
                    desc: String::new(),
                    closed: true,
                    id_list: "l1".to_string(),
                },
            );
            self
        }

        pub fn comments_on(&self, card_id: &str) -> Vec<String> {
            self.state
                .lock()
                .comments
                .iter()
                .filter(|(id, _)| id == card_id)
                .map(|(_, text)| text.clone())
                .collect()
        }

        pub fn card_count(&self) -> usize {
            self.state.lock().cards.len()
        }

        fn unavailable() -> BoardError {
            BoardError::Status {
                status: 503,
                body: "unavailable".into(),
            }
        }
    }

    impl FakeBoardState {
        fn next(&mut self, prefix: &str) -> String {
            self.next_id += 1;
            format!("{prefix}{}", self.next_id)
        }

        fn find(&self, card: &str) -> Option<&Card> {
            self.cards
                .values()
                .find(|c| c.id == card || c.short_link == card)
        }
    }

    #[async_trait]
    impl BoardProvider for FakeBoard {
        async fn card(&self, card: &str) -> Result<Card, BoardError> {
            let state = self.state.lock();
            if state.fail_fetch {
                return Err(Self::unavailable());
            }
            state
                .find(card)
                .cloned()
                .ok_or_else(|| BoardError::NotFound(format!("card {card}")))
        }

        async fn create_card(&self, card: &NewCard) -> Result<Card, BoardError> {
            let mut state = self.state.lock();
            if state.fail_create_card {
                return Err(Self::unavailable());
            }
            let id = state.next("card");
            let created = Card {
                short_link: format!("sl-{id}"),
                id: id.clone(),
                name: card.name.clone(),
                desc: card.desc.clone(),
                closed: false,
                id_list: card.list_id.clone(),
            };
            state.cards.insert(id, created.clone());
            Ok(created)
        }

        async fn delete_card(&self, card_id: &str) -> Result<(), BoardError> {
            let mut state = self.state.lock();
            state.cards.remove(card_id);
            state.deleted_cards.push(card_id.to_string());
            Ok(())
        }

        async fn revive_card(&self, card_id: &str) -> Result<(), BoardError> {
            let mut state = self.state.lock();
            if let Some(card) = state.cards.get_mut(card_id) {
                card.closed = false;
            }
            state.revived.push(card_id.to_string());
            Ok(())
        }

        async fn move_to_top(&self, card_id: &str) -> Result<(), BoardError> {
            self.state.lock().moved_to_top.push(card_id.to_string());
            Ok(())
        }

        async fn add_comment(&self, card_id: &str, text: &str) -> Result<Comment, BoardError> {
            let mut state = self.state.lock();
            if state.fail_comments {
                return Err(Self::unavailable());
            }
            let id = state.next("comment");
            state.comments.push((card_id.to_string(), text.to_string()));
            Ok(Comment { id })
        }

        async fn attach(&self, card_id: &str, upload: Upload) -> Result<Attachment, BoardError> {
            let mut state = self.state.lock();
            let id = state.next("att");
            state
                .attachments
                .push((card_id.to_string(), upload.name.clone(), upload.bytes.len()));
            Ok(Attachment {
                url: format!("https://board.test/{card_id}/{id}/{}", upload.name),
                id,
            })
        }

        async fn set_description(&self, card_id: &str, desc: &str) -> Result<(), BoardError> {
            let mut state = self.state.lock();
            match state.cards.get_mut(card_id) {
                Some(card) => {
                    card.desc = desc.to_string();
                    Ok(())
                }
                None => Err(BoardError::NotFound(format!("card {card_id}"))),
            }
        }

        async fn add_member(&self, card_id: &str, member_id: &str) -> Result<(), BoardError> {
            self.state
                .lock()
                .members
                .push((card_id.to_string(), member_id.to_string()));
            Ok(())
        }

        async fn create_webhook(
            &self,
            model_id: &str,
            _callback_url: &str,
        ) -> Result<String, BoardError> {
            let mut state = self.state.lock();
            if state.fail_webhooks {
                return Err(Self::unavailable());
            }
            let id = state.next("wh");
            state.webhooks.push((id.clone(), model_id.to_string()));
            Ok(id)
        }

        async fn delete_webhook(&self, webhook_id: &str) -> Result<(), BoardError> {
            self.state
                .lock()
                .deleted_webhooks
                .push(webhook_id.to_string());
            Ok(())
        }
    }
}
