//! Billing provider. Only subscription cancellation is needed here; checkout
//! happens elsewhere.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("subscription {0} not found")]
    NotFound(String),

    #[error("billing API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("billing provider not configured")]
    NotConfigured,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn cancel_subscription(&self, profile_id: &str) -> Result<(), BillingError>;
}

pub struct HttpBilling {
    client: Client,
    api_url: Option<String>,
    api_token: String,
}

impl HttpBilling {
    pub fn new(
        api_url: Option<&str>,
        api_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, BillingError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.map(|u| u.trim_end_matches('/').to_string()),
            api_token: api_token.unwrap_or_default().to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, BillingError> {
        Self::new(
            config.billing_api_url.as_deref(),
            config.billing_api_token.as_deref(),
            config.request_timeout(),
        )
    }
}

#[async_trait]
impl BillingProvider for HttpBilling {
    async fn cancel_subscription(&self, profile_id: &str) -> Result<(), BillingError> {
        let api_url = self.api_url.as_deref().ok_or(BillingError::NotConfigured)?;
        let resp = self
            .client
            .post(format!("{api_url}/subscriptions/{profile_id}/cancel"))
            .bearer_auth(&self.api_token)
            .json(&json!({ "reason": "address deleted" }))
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::NotFound(profile_id.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!(profile = %profile_id, "billing_subscription_cancelled");
        Ok(())
    }
}
