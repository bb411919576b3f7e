//! Trello REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::{Attachment, BoardError, BoardProvider, Card, Comment, NewCard, Upload};
use crate::config::Config;

const API_URL: &str = "https://api.trello.com/1";

const CARD_FIELDS: &str = "id,shortLink,name,desc,closed,idList";

pub struct TrelloClient {
    client: Client,
    base_url: String,
    key: String,
    token: String,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

impl TrelloClient {
    pub fn new(key: &str, token: &str, timeout: Duration) -> Result<Self, BoardError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: API_URL.to_string(),
            key: key.to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, BoardError> {
        Self::new(
            &config.trello_api_key,
            &config.trello_bot_token,
            config.request_timeout(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&[("key", &self.key), ("token", &self.token)])
    }

    /// Send and map non-success statuses; 404 becomes `NotFound(what)`.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, BoardError> {
        let resp = self.authed(request).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BoardError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(what = what, status = status.as_u16(), body = %body, "trello_request_failed");
            return Err(BoardError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl BoardProvider for TrelloClient {
    async fn card(&self, card: &str) -> Result<Card, BoardError> {
        let request = self
            .client
            .get(self.url(&format!("/cards/{card}")))
            .query(&[("fields", CARD_FIELDS)]);
        let resp = self.send(request, &format!("card {card}")).await?;
        Ok(resp.json().await?)
    }

    async fn create_card(&self, card: &NewCard) -> Result<Card, BoardError> {
        let members = card.member_ids.join(",");
        let request = self.client.post(self.url("/cards")).query(&[
            ("idList", card.list_id.as_str()),
            ("name", card.name.as_str()),
            ("desc", card.desc.as_str()),
            ("pos", "top"),
            ("idMembers", members.as_str()),
        ]);
        let resp = self.send(request, &format!("list {}", card.list_id)).await?;
        let created: Card = resp.json().await?;
        info!(card = %created.id, list = %card.list_id, "trello_card_created");
        Ok(created)
    }

    async fn delete_card(&self, card_id: &str) -> Result<(), BoardError> {
        let request = self.client.delete(self.url(&format!("/cards/{card_id}")));
        self.send(request, &format!("card {card_id}")).await?;
        Ok(())
    }

    async fn revive_card(&self, card_id: &str) -> Result<(), BoardError> {
        let request = self
            .client
            .put(self.url(&format!("/cards/{card_id}")))
            .query(&[("closed", "false")]);
        self.send(request, &format!("card {card_id}")).await?;
        Ok(())
    }

    async fn move_to_top(&self, card_id: &str) -> Result<(), BoardError> {
        let request = self
            .client
            .put(self.url(&format!("/cards/{card_id}")))
            .query(&[("pos", "top")]);
        self.send(request, &format!("card {card_id}")).await?;
        Ok(())
    }

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<Comment, BoardError> {
        let request = self
            .client
            .post(self.url(&format!("/cards/{card_id}/actions/comments")))
            .query(&[("text", text)]);
        let resp = self.send(request, &format!("card {card_id}")).await?;
        Ok(resp.json().await?)
    }

    async fn attach(&self, card_id: &str, upload: Upload) -> Result<Attachment, BoardError> {
        let mime = if upload.mime.contains('/') {
            upload.mime.as_str()
        } else {
            "application/octet-stream"
        };
        let part = Part::bytes(upload.bytes)
            .file_name(upload.name.clone())
            .mime_str(mime)?;
        let form = Form::new().text("name", upload.name).part("file", part);
        let request = self
            .client
            .post(self.url(&format!("/cards/{card_id}/attachments")))
            .multipart(form);
        let resp = self.send(request, &format!("card {card_id}")).await?;
        Ok(resp.json().await?)
    }

    async fn set_description(&self, card_id: &str, desc: &str) -> Result<(), BoardError> {
        let request = self
            .client
            .put(self.url(&format!("/cards/{card_id}")))
            .query(&[("desc", desc)]);
        self.send(request, &format!("card {card_id}")).await?;
        Ok(())
    }

    async fn add_member(&self, card_id: &str, member_id: &str) -> Result<(), BoardError> {
        let request = self
            .client
            .post(self.url(&format!("/cards/{card_id}/idMembers")))
            .query(&[("value", member_id)]);
        self.send(request, &format!("card {card_id}")).await?;
        Ok(())
    }

    async fn create_webhook(
        &self,
        model_id: &str,
        callback_url: &str,
    ) -> Result<String, BoardError> {
        let request = self
            .client
            .post(self.url("/webhooks"))
            .query(&[("idModel", model_id), ("callbackURL", callback_url)]);
        let resp = self.send(request, &format!("model {model_id}")).await?;
        let created: Created = resp.json().await?;
        Ok(created.id)
    }

    async fn delete_webhook(&self, webhook_id: &str) -> Result<(), BoardError> {
        let request = self
            .client
            .delete(self.url(&format!("/webhooks/{webhook_id}")));
        self.send(request, &format!("webhook {webhook_id}")).await?;
        Ok(())
    }
}
