//! Webhook endpoint handlers.
//!
//! Each handler authenticates the caller, hands the payload to its pipeline
//! and maps the outcome to a status code the sender understands: 406 tells
//! the relay to drop a message for good, 503 asks it to retry.

use axum::{
    extract::{Form, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::events::{self, BoardEvent, EventOutcome};
use crate::inbound::{parse_cloudflare, parse_mailgun, CloudflarePayload, MailgunForm};
use crate::ingest::{ingest, IngestOutcome};
use crate::reply;
use crate::state::AppState;
use crate::web::signature::{check_secret, signing_key, AuthError, MailgunSignature};

// =============================================================================
// Responses
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Webhook response.
#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WebhookResponse {
    pub fn status(status: &'static str) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn ignored(reason: &str) -> Self {
        Self {
            status: "ignored",
            detail: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// A failed request, rendered as a status code plus [`WebhookResponse`].
#[derive(Debug, Error)]
pub enum WebError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl WebError {
    fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            WebError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            WebError::Bridge(e) => match e {
                BridgeError::Validation(_) => (StatusCode::BAD_REQUEST, "rejected"),
                BridgeError::Unrouted(_) => (StatusCode::NOT_ACCEPTABLE, "unrouted"),
                BridgeError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                BridgeError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, "retry"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
            },
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (code, status) = self.status_code();
        let detail = if code.is_server_error() {
            error!(status = code.as_u16(), error = %self, "request_failed");
            if code == StatusCode::SERVICE_UNAVAILABLE {
                "upstream unavailable".to_string()
            } else {
                "internal error".to_string()
            }
        } else {
            warn!(status = code.as_u16(), error = %self, "request_rejected");
            self.to_string()
        };
        let body = WebhookResponse {
            status,
            detail: Some(detail),
            ..WebhookResponse::default()
        };
        (code, Json(body)).into_response()
    }
}

type WebResult = Result<Json<WebhookResponse>, WebError>;

/// Verify a Mailgun signature when a signing key is configured.
fn verify_mailgun(config: &Config, signature: MailgunSignature<'_>) -> Result<(), AuthError> {
    let Some(key) = signing_key(&config.mailgun_signing_key) else {
        return Ok(());
    };
    signature
        .verify(key, config.mailgun_signature_max_age)
        .map_err(|e| {
            warn!(error = %e, "mailgun_signature_invalid");
            e
        })
}

fn ingested(outcome: IngestOutcome) -> WebhookResponse {
    let status = match &outcome {
        IngestOutcome::Created(_) => "created",
        IngestOutcome::Continued(_) => "continued",
        IngestOutcome::Duplicate(_) => "duplicate",
    };
    WebhookResponse {
        status,
        card: Some(outcome.card().short_link.clone()),
        ..WebhookResponse::default()
    }
}

// =============================================================================
// Inbound mail
// =============================================================================

/// Mailgun "store and notify" endpoint.
pub async fn mailgun_email(
    State(state): State<AppState>,
    Form(form): Form<MailgunForm>,
) -> WebResult {
    info!(
        recipient = %form.recipient,
        has_body_html = form.body_html.is_some(),
        body_html_length = form.body_html.as_ref().map(|s| s.len()).unwrap_or(0),
        has_signature = !form.signature.is_empty(),
        "mailgun_email_received"
    );

    verify_mailgun(
        &state.config,
        MailgunSignature {
            timestamp: &form.timestamp,
            token: &form.token,
            signature: &form.signature,
        },
    )?;

    let message = parse_mailgun(form)?;
    let outcome = ingest(&state, &message).await?;
    Ok(Json(ingested(outcome)))
}

/// Raw MIME endpoint fed by a Cloudflare Email Worker.
pub async fn cloudflare_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CloudflarePayload>,
) -> WebResult {
    info!(
        from = %payload.from_field,
        to = %payload.to,
        raw_content_length = payload.raw_content.len(),
        "cloudflare_email_received"
    );

    match state.config.cloudflare_auth_token.as_deref() {
        Some(expected) => {
            let provided = headers.get("X-Custom-Auth").and_then(|v| v.to_str().ok());
            check_secret(provided, expected).map_err(|e| {
                warn!(to = %payload.to, error = %e, "cloudflare_auth_invalid");
                e
            })?;
        }
        None => warn!("cloudflare_auth_not_configured"),
    }

    let message = parse_cloudflare(payload)?;
    let outcome = ingest(&state, &message).await?;
    Ok(Json(ingested(outcome)))
}

// =============================================================================
// Delivery status
// =============================================================================

/// Delivery event posted by the relay. Custom variables attached when the
/// reply was sent come back as top-level fields, sometimes JSON-quoted.
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryForm {
    #[serde(default)]
    pub card: String,
    #[serde(default)]
    pub commenter: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

impl DeliveryForm {
    fn signature(&self) -> MailgunSignature<'_> {
        MailgunSignature {
            timestamp: &self.timestamp,
            token: &self.token,
            signature: &self.signature,
        }
    }

    fn card(&self) -> &str {
        unquote(&self.card)
    }

    /// Most specific failure text available.
    fn failure(&self) -> &str {
        [&self.description, &self.error, &self.reason]
            .into_iter()
            .map(|s| unquote(s))
            .find(|s| !s.is_empty())
            .unwrap_or("unknown error")
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

pub async fn mailgun_success(
    State(state): State<AppState>,
    Form(form): Form<DeliveryForm>,
) -> WebResult {
    verify_mailgun(&state.config, form.signature())?;
    let card = form.card();
    if card.is_empty() {
        return Ok(Json(WebhookResponse::ignored("no_card")));
    }

    match reply::delivered(&state, card, unquote(&form.commenter)).await {
        Ok(()) => Ok(Json(WebhookResponse {
            card: Some(card.to_string()),
            ..WebhookResponse::status("recorded")
        })),
        Err(BridgeError::NotFound(_)) => Ok(Json(WebhookResponse::ignored("unknown_card"))),
        Err(e) => Err(e.into()),
    }
}

pub async fn mailgun_failure(
    State(state): State<AppState>,
    Form(form): Form<DeliveryForm>,
) -> WebResult {
    verify_mailgun(&state.config, form.signature())?;
    let card = form.card();
    if card.is_empty() {
        return Ok(Json(WebhookResponse::ignored("no_card")));
    }

    reply::failed(&state, card, unquote(&form.recipient), form.failure()).await?;
    Ok(Json(WebhookResponse {
        card: Some(card.to_string()),
        ..WebhookResponse::status("recorded")
    }))
}

// =============================================================================
// Board events
// =============================================================================

/// Answers the board's webhook registration probe.
pub async fn board_probe() -> StatusCode {
    StatusCode::OK
}

pub async fn board_event(
    State(state): State<AppState>,
    Json(event): Json<BoardEvent>,
) -> WebResult {
    let response = match events::handle(&state, &event).await? {
        EventOutcome::Sent { message_id } => WebhookResponse {
            message_id: Some(message_id),
            ..WebhookResponse::status("sent")
        },
        EventOutcome::AlreadySent => WebhookResponse::status("already_sent"),
        EventOutcome::CardRemoved => WebhookResponse::status("card_removed"),
        EventOutcome::ThreadUpdated => WebhookResponse::status("thread_updated"),
        EventOutcome::Dropped(reason) => WebhookResponse::ignored(reason),
    };
    Ok(Json(response))
}
