//! Address management API.
//!
//! Callers authenticate with `Authorization: Bearer <API_TOKEN>` and name the
//! acting user in `X-User-Id`. The API is closed while no token is configured.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::domain_of;
use crate::delegation::{self, inbound_address};
use crate::error::BridgeError;
use crate::relay::{Capabilities, DnsSummary};
use crate::state::AppState;
use crate::store::{Address, AddressSettings};
use crate::web::handlers::{WebError, WebhookResponse};
use crate::web::signature::{check_secret, AuthError};

/// The user an authenticated request acts for.
fn api_user(state: &AppState, headers: &HeaderMap) -> Result<String, WebError> {
    let expected = state
        .config
        .api_token
        .as_deref()
        .ok_or(AuthError::MissingSecret)?;
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    check_secret(bearer, expected).map_err(|e| {
        warn!(error = %e, "api_auth_invalid");
        e
    })?;

    headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BridgeError::Validation("missing X-User-Id".into()).into())
}

fn owned_address(state: &AppState, user: &str, local: &str) -> Result<Address, WebError> {
    let address = inbound_address(&state.config.base_domain, local)?;
    state
        .store
        .get_address(user, &address)
        .map_err(BridgeError::from)?
        .ok_or_else(|| BridgeError::NotFound(format!("address {address}")).into())
}

/// An address with the relay's view of its outbound domain.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressView {
    #[serde(flatten)]
    pub address: Address,
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSummary>,
}

async fn describe(state: &AppState, address: Address) -> AddressView {
    let domain = if address.is_delegated() {
        domain_of(&address.outbound)
    } else {
        None
    };
    let Some(domain) = domain else {
        return AddressView {
            address,
            capabilities: Capabilities {
                can_send: true,
                can_receive: true,
            },
            dns: None,
        };
    };

    match state.relay.domain_records(&domain).await {
        Ok(records) => {
            let summary = DnsSummary::extract(&domain, &records);
            AddressView {
                address,
                capabilities: summary.capabilities(),
                dns: Some(summary),
            }
        }
        Err(e) => {
            warn!(domain = %domain, error = %e, "api_domain_lookup_failed");
            AddressView {
                address,
                capabilities: Capabilities::default(),
                dns: None,
            }
        }
    }
}

pub async fn list_addresses(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Address>>, WebError> {
    let user = api_user(&state, &headers)?;
    let addresses = state
        .store
        .list_addresses(&user)
        .map_err(BridgeError::from)?;
    Ok(Json(addresses))
}

pub async fn get_address(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local): Path<String>,
) -> Result<Json<AddressView>, WebError> {
    let user = api_user(&state, &headers)?;
    let address = owned_address(&state, &user, &local)?;
    Ok(Json(describe(&state, address).await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTarget {
    pub board_short_link: String,
    pub list_id: String,
}

pub async fn put_address(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local): Path<String>,
    Json(target): Json<ListTarget>,
) -> Result<Json<Address>, WebError> {
    let user = api_user(&state, &headers)?;
    let address = delegation::configure_address(
        &state,
        &user,
        &target.board_short_link,
        &target.list_id,
        &local,
    )
    .await?;
    Ok(Json(address))
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboundRequest {
    /// Absent or null reverts to self-sending
    #[serde(default)]
    pub outbound: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundView {
    pub inbound: String,
    pub outbound: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_domain: Option<String>,
    /// Another user owns the requested domain
    pub denied: bool,
}

pub async fn put_outbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local): Path<String>,
    Json(request): Json<OutboundRequest>,
) -> Result<Json<OutboundView>, WebError> {
    let user = api_user(&state, &headers)?;
    let inbound = inbound_address(&state.config.base_domain, &local)?;
    let update =
        delegation::set_outbound(&state, &user, &inbound, request.outbound.as_deref()).await?;
    Ok(Json(OutboundView {
        outbound: update
            .change
            .applied
            .outbound()
            .unwrap_or(&inbound)
            .to_string(),
        inbound,
        route_id: update.route_id,
        released_domain: update.released_domain,
        denied: update.change.denied_owner.is_some(),
    }))
}

pub async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local): Path<String>,
    Json(settings): Json<AddressSettings>,
) -> Result<Json<Address>, WebError> {
    let user = api_user(&state, &headers)?;
    let address = owned_address(&state, &user, &local)?;
    state
        .store
        .set_address_settings(&address.inbound, &settings)
        .map_err(BridgeError::from)?;
    Ok(Json(owned_address(&state, &user, &local)?))
}

pub async fn delete_address(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(local): Path<String>,
) -> Result<Json<WebhookResponse>, WebError> {
    let user = api_user(&state, &headers)?;
    let inbound = inbound_address(&state.config.base_domain, &local)?;
    delegation::delete_address(&state, &user, &inbound).await?;
    Ok(Json(WebhookResponse::status("deleted")))
}
