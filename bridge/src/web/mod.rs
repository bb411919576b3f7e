//! HTTP surface: inbound mail and board webhooks, delivery callbacks and the
//! address management API.

pub mod api;
pub mod handlers;
pub mod signature;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub use crate::state::AppState;
pub use handlers::{HealthResponse, WebError, WebhookResponse};
pub use signature::{AuthError, MailgunSignature};

/// Every route of the service, traced.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/mailgun/email", post(handlers::mailgun_email))
        .route("/webhooks/cloudflare/email", post(handlers::cloudflare_email))
        .route("/webhooks/mailgun/success", post(handlers::mailgun_success))
        .route("/webhooks/mailgun/failure", post(handlers::mailgun_failure))
        // GET also answers HEAD
        .route(
            "/webhooks/trello/card",
            get(handlers::board_probe).post(handlers::board_event),
        )
        .route("/api/addresses", get(api::list_addresses))
        .route(
            "/api/addresses/:local",
            get(api::get_address)
                .put(api::put_address)
                .delete(api::delete_address),
        )
        .route("/api/addresses/:local/outbound", put(api::put_outbound))
        .route("/api/addresses/:local/settings", put(api::put_settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
