//! Address configuration and the outbound delegation lifecycle.
//!
//! The store decides who may bind what. This module keeps the relay in step
//! with it: domains, delivery webhooks and routes are created when a
//! delegation starts and removed once nothing sends through them.

use tracing::{error, info, warn};

use crate::address::{domain_of, is_email, normalize_address};
use crate::error::{BridgeError, Result};
use crate::relay::OutboundMessage;
use crate::state::AppState;
use crate::store::{Address, Binding, OutboundChange, SetAddressOutcome};

pub const WELCOME_SUBJECT: &str = "Welcome to BoardThreads";

/// Relay events reported back to the delivery endpoints.
const DELIVERY_EVENTS: [&str; 2] = ["delivered", "permanent_fail"];

/// Full inbound address for `local`, which may already carry the base domain.
pub fn inbound_address(base_domain: &str, local: &str) -> Result<String> {
    let local = local.trim();
    let address = if local.contains('@') {
        normalize_address(local)
    } else {
        normalize_address(&format!("{local}@{base_domain}"))
    };
    if !is_email(&address) {
        return Err(BridgeError::Validation(format!("address {address}")));
    }
    match domain_of(&address) {
        Some(domain) if domain.eq_ignore_ascii_case(base_domain) => Ok(address),
        _ => Err(BridgeError::Validation(format!(
            "{address} is not on {base_domain}"
        ))),
    }
}

fn welcome_text(address: &str) -> String {
    format!(
        "Hello and welcome to BoardThreads. This is a test message with the sole purpose \
         of showing you how emails sent to {address} will appear to you.\n\n\
         To send replies you can just write a normal comment, only prefixed with \
         :email: or :e-mail:, and it will be sent to the address that wrote to you."
    )
}

/// Create an address on a list, or move an existing one to another list.
///
/// A new address gets a welcome mail so the first card shows up right away.
pub async fn configure_address(
    state: &AppState,
    user_id: &str,
    board_short_link: &str,
    list_id: &str,
    local: &str,
) -> Result<Address> {
    if board_short_link.is_empty() || list_id.is_empty() {
        return Err(BridgeError::Validation("board and list are required".into()));
    }
    let base_domain = state.config.base_domain.as_str();
    let address = inbound_address(base_domain, local)?;

    match state
        .store
        .set_address(user_id, board_short_link, list_id, &address)?
    {
        SetAddressOutcome::Forbidden => {
            warn!(user = %user_id, address = %address, "address_forbidden");
            return Err(BridgeError::Forbidden(address));
        }
        SetAddressOutcome::Repointed => {
            info!(user = %user_id, address = %address, list = %list_id, "address_repointed");
        }
        SetAddressOutcome::Created => {
            info!(user = %user_id, address = %address, list = %list_id, "address_created");
            let welcome = OutboundMessage {
                from: format!("welcome@{base_domain}"),
                to: vec![address.clone()],
                subject: WELCOME_SUBJECT.to_string(),
                text: welcome_text(&address),
                ..OutboundMessage::default()
            };
            if let Err(e) = state.relay.send(base_domain, &welcome).await {
                warn!(address = %address, error = %e, "address_welcome_failed");
            }
        }
    }

    state
        .store
        .get_address(user_id, &address)?
        .ok_or_else(|| BridgeError::NotFound(format!("address {address}")))
}

/// What an outbound change did on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundUpdate {
    pub change: OutboundChange,
    /// Relay route created for the new delegation
    pub route_id: Option<String>,
    /// Domain whose ownership was released by this change
    pub released_domain: Option<String>,
}

/// Point `address` at a new outbound identity, or back to itself with `None`.
pub async fn set_outbound(
    state: &AppState,
    user_id: &str,
    address: &str,
    outbound: Option<&str>,
) -> Result<OutboundUpdate> {
    let address = normalize_address(address);
    let target = outbound
        .map(normalize_address)
        .filter(|o| !o.is_empty())
        .and_then(|o| {
            let acceptable = is_email(&o) && domain_of(&o) != domain_of(&address);
            if !acceptable {
                warn!(address = %address, outbound = %o, "outbound_rejected_self_sending");
            }
            acceptable.then_some(o)
        });

    let change = state
        .store
        .set_outbound(user_id, &address, target.as_deref())?;
    if let Some(owner) = &change.denied_owner {
        warn!(
            address = %address,
            outbound = ?target,
            owner = %owner,
            "outbound_domain_owned_elsewhere"
        );
    }

    let mut route_id = None;
    if change.changed() {
        if let Binding::Delegated {
            outbound, domain, ..
        } = &change.applied
        {
            route_id = provision(state, &address, outbound, domain).await;
        }
    }

    let released_domain = if change.changed() {
        release(state, &change.previous).await?
    } else {
        None
    };

    info!(
        address = %address,
        previous = change.previous.outbound().unwrap_or(&address),
        applied = change.applied.outbound().unwrap_or(&address),
        "outbound_updated"
    );
    Ok(OutboundUpdate {
        change,
        route_id,
        released_domain,
    })
}

/// Register `domain` with the relay and route `outbound` to `inbound`.
///
/// Failures are logged; the store keeps the delegation and the capability
/// check stops replies from going out through an unverified domain.
async fn provision(state: &AppState, inbound: &str, outbound: &str, domain: &str) -> Option<String> {
    let relay = state.relay.as_ref();

    if let Err(e) = relay.create_domain(domain).await {
        if relay.domain_records(domain).await.is_err() {
            error!(domain = %domain, error = %e, "relay_domain_create_failed");
            return None;
        }
        info!(domain = %domain, "relay_domain_exists");
    }

    let (success, failure) = state.config.delivery_webhook_urls();
    for (event, url) in DELIVERY_EVENTS.iter().zip([success, failure]) {
        if let Err(e) = relay.create_webhook(domain, event, &url).await {
            warn!(domain = %domain, event = %event, error = %e, "relay_webhook_failed");
        }
    }

    let route_id = match relay.create_route(outbound, inbound).await {
        Ok(id) => id,
        Err(e) => {
            error!(outbound = %outbound, inbound = %inbound, error = %e, "relay_route_failed");
            return None;
        }
    };
    if let Err(e) = state.store.save_route_id(inbound, outbound, &route_id) {
        error!(outbound = %outbound, route = %route_id, error = %e, "route_id_not_saved");
    }
    info!(domain = %domain, outbound = %outbound, route = %route_id, "delegation_provisioned");
    Some(route_id)
}

/// Tear down what a binding held on the relay. Runs after the store dropped
/// the edge, so the release check sees the new state.
async fn release(state: &AppState, previous: &Binding) -> Result<Option<String>> {
    let Binding::Delegated {
        domain, route_id, ..
    } = previous
    else {
        return Ok(None);
    };

    if let Some(route_id) = route_id {
        if let Err(e) = state.relay.delete_route(route_id).await {
            warn!(route = %route_id, error = %e, "relay_route_delete_failed");
        }
    }

    if !state.store.release_domain_if_unreferenced(domain)? {
        return Ok(None);
    }
    info!(domain = %domain, "domain_released");
    if let Err(e) = state.relay.delete_domain(domain).await {
        warn!(domain = %domain, error = %e, "relay_domain_delete_failed");
    }
    Ok(Some(domain.clone()))
}

/// Remove an address with everything hanging off it.
pub async fn delete_address(state: &AppState, user_id: &str, address: &str) -> Result<()> {
    let existing = state
        .store
        .get_address(user_id, address)?
        .ok_or_else(|| BridgeError::NotFound(format!("address {address}")))?;

    if let Some(profile) = &existing.billing_profile_id {
        match state.billing.cancel_subscription(profile).await {
            Ok(()) => info!(address = %existing.inbound, profile = %profile, "billing_cancelled"),
            Err(e) => error!(
                address = %existing.inbound,
                profile = %profile,
                error = %e,
                "billing_cancel_failed"
            ),
        }
        state.store.clear_billing_profile(&existing.inbound)?;
    }

    state.store.delete_address(&existing.inbound)?;
    info!(user = %user_id, address = %existing.inbound, "address_deleted");

    let previous = match (existing.is_delegated(), domain_of(&existing.outbound)) {
        (true, Some(domain)) => Binding::Delegated {
            outbound: existing.outbound.clone(),
            domain,
            route_id: existing.route_id.clone(),
        },
        _ => Binding::SelfSending,
    };
    release(state, &previous).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::testing::FakeBilling;
    use crate::board::testing::FakeBoard;
    use crate::relay::testing::FakeRelay;
    use crate::state::testing::Harness;

    #[test]
    fn test_inbound_address() {
        assert_eq!(inbound_address("x.com", "Sales").unwrap(), "sales@x.com");
        assert_eq!(inbound_address("x.com", "sales@X.com").unwrap(), "sales@x.com");
        assert!(inbound_address("x.com", "sales@y.com").unwrap_err().is_rejection());
        assert!(inbound_address("x.com", "").is_err());
    }

    #[tokio::test]
    async fn test_configure_new_address_sends_welcome() {
        let h = Harness::new();

        let address = configure_address(&h.state, "u1", "b1", "l9", "Sales")
            .await
            .unwrap();
        assert_eq!(address.inbound, "sales@x.com");
        assert_eq!(address.list_id, "l9");
        assert!(!address.is_delegated());

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "x.com");
        assert_eq!(sent[0].1.from, "welcome@x.com");
        assert_eq!(sent[0].1.to, vec!["sales@x.com"]);
        assert_eq!(sent[0].1.subject, WELCOME_SUBJECT);
    }

    #[tokio::test]
    async fn test_configure_existing_address_repoints_quietly() {
        let h = Harness::new();

        let address = configure_address(&h.state, "u1", "b1", "l2", "a").await.unwrap();
        assert_eq!(address.list_id, "l2");
        assert_eq!(h.store().target_list("a@x.com").unwrap().as_deref(), Some("l2"));
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_configure_address_of_other_user_is_forbidden() {
        let h = Harness::new();

        let err = configure_address(&h.state, "u2", "b2", "l2", "a").await.unwrap_err();
        assert!(matches!(err, BridgeError::Forbidden(_)));
        assert_eq!(h.store().target_list("a@x.com").unwrap().as_deref(), Some("l1"));
    }

    #[tokio::test]
    async fn test_configure_survives_welcome_failure() {
        let relay = FakeRelay::new();
        relay.state.lock().fail_send = true;
        let h = Harness::with(FakeBoard::new(), relay, FakeBilling::new());

        let address = configure_address(&h.state, "u1", "b1", "l1", "new").await.unwrap();
        assert_eq!(address.inbound, "new@x.com");
    }

    #[tokio::test]
    async fn test_delegation_provisions_relay() {
        let h = Harness::new();

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("Help@Biz.com"))
            .await
            .unwrap();
        assert_eq!(update.change.applied.outbound(), Some("help@biz.com"));
        let route_id = update.route_id.expect("route");

        let relay = h.relay.state.lock();
        assert_eq!(relay.domains, vec!["biz.com"]);
        assert_eq!(
            relay.routes.get(&route_id),
            Some(&("help@biz.com".to_string(), "a@x.com".to_string()))
        );
        let events: Vec<&str> = relay.webhooks.iter().map(|(_, e, _)| e.as_str()).collect();
        assert_eq!(events, vec!["delivered", "permanent_fail"]);
        assert_eq!(
            relay.webhooks[0].2,
            "https://bridge.test/webhooks/mailgun/success"
        );
        drop(relay);

        let stored = h.store().get_address("u1", "a@x.com").unwrap().unwrap();
        assert_eq!(stored.route_id.as_deref(), Some(route_id.as_str()));
        assert_eq!(stored.domain.as_deref(), Some("biz.com"));
    }

    #[tokio::test]
    async fn test_existing_relay_domain_is_accepted() {
        let relay = FakeRelay::new().with_verified_domain("biz.com");
        relay.state.lock().fail_create_domain = true;
        let h = Harness::with(FakeBoard::new(), relay, FakeBilling::new());

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();
        assert!(update.route_id.is_some());
    }

    #[tokio::test]
    async fn test_relay_outage_keeps_delegation_without_route() {
        let relay = FakeRelay::new();
        relay.state.lock().fail_create_domain = true;
        let h = Harness::with(FakeBoard::new(), relay, FakeBilling::new());

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();
        assert_eq!(update.route_id, None);
        assert_eq!(update.change.applied.domain(), Some("biz.com"));
        assert!(h.relay.state.lock().routes.is_empty());
    }

    #[tokio::test]
    async fn test_same_domain_outbound_forces_self_sending() {
        let h = Harness::new();

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("b@x.com"))
            .await
            .unwrap();
        assert_eq!(update.change.applied, Binding::SelfSending);
        assert!(h.relay.state.lock().domains.is_empty());

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("not an address"))
            .await
            .unwrap();
        assert_eq!(update.change.applied, Binding::SelfSending);
    }

    #[tokio::test]
    async fn test_domain_of_other_user_is_not_taken_over() {
        let h = Harness::new();
        h.store().set_address("u2", "b2", "l2", "b@x.com").unwrap();
        set_outbound(&h.state, "u2", "b@x.com", Some("help@biz.com"))
            .await
            .unwrap();

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("sales@biz.com"))
            .await
            .unwrap();
        assert_eq!(update.change.applied, Binding::SelfSending);
        assert_eq!(update.change.denied_owner.as_deref(), Some("u2"));
        assert_eq!(h.store().domain_owner("biz.com").unwrap().as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_undelegating_last_address_releases_domain() {
        let h = Harness::new();
        let first = set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();
        let route_id = first.route_id.unwrap();

        let update = set_outbound(&h.state, "u1", "a@x.com", None).await.unwrap();
        assert_eq!(update.released_domain.as_deref(), Some("biz.com"));
        assert_eq!(h.store().domain_owner("biz.com").unwrap(), None);

        let relay = h.relay.state.lock();
        assert_eq!(relay.deleted_routes, vec![route_id]);
        assert_eq!(relay.deleted_domains, vec!["biz.com"]);
    }

    #[tokio::test]
    async fn test_shared_domain_stays_while_referenced() {
        let h = Harness::new();
        h.store().set_address("u1", "b1", "l1", "b@x.com").unwrap();
        set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();
        set_outbound(&h.state, "u1", "b@x.com", Some("sales@biz.com"))
            .await
            .unwrap();

        let update = set_outbound(&h.state, "u1", "a@x.com", None).await.unwrap();
        assert_eq!(update.released_domain, None);
        assert_eq!(h.store().domain_owner("biz.com").unwrap().as_deref(), Some("u1"));
        assert!(h.relay.state.lock().deleted_domains.is_empty());
    }

    #[tokio::test]
    async fn test_shared_outbound_reverting_deletes_only_own_route() {
        let h = Harness::new();
        h.store().set_address("u1", "b1", "l1", "b@x.com").unwrap();
        let a_route = set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap()
            .route_id
            .unwrap();
        let b_route = set_outbound(&h.state, "u1", "b@x.com", Some("help@biz.com"))
            .await
            .unwrap()
            .route_id
            .unwrap();
        assert_ne!(a_route, b_route);

        let stored = h.store().get_address("u1", "a@x.com").unwrap().unwrap();
        assert_eq!(stored.route_id.as_deref(), Some(a_route.as_str()));

        let update = set_outbound(&h.state, "u1", "a@x.com", None).await.unwrap();
        assert_eq!(update.released_domain, None);

        let relay = h.relay.state.lock();
        assert_eq!(relay.deleted_routes, vec![a_route.clone()]);
        assert!(!relay.routes.contains_key(&a_route));
        assert_eq!(
            relay.routes.get(&b_route),
            Some(&("help@biz.com".to_string(), "b@x.com".to_string()))
        );
        drop(relay);

        let b = h.store().get_address("u1", "b@x.com").unwrap().unwrap();
        assert_eq!(b.route_id.as_deref(), Some(b_route.as_str()));
    }

    #[tokio::test]
    async fn test_unchanged_outbound_touches_nothing() {
        let h = Harness::new();
        set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();
        let routes_before = h.relay.state.lock().routes.len();

        let update = set_outbound(&h.state, "u1", "a@x.com", Some("HELP@biz.com"))
            .await
            .unwrap();
        assert!(!update.change.changed());
        assert_eq!(update.route_id, None);
        assert_eq!(h.relay.state.lock().routes.len(), routes_before);
    }

    #[tokio::test]
    async fn test_set_outbound_on_foreign_address_is_forbidden() {
        let h = Harness::new();
        let err = set_outbound(&h.state, "u2", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Forbidden(_)));

        let err = set_outbound(&h.state, "u1", "zz@x.com", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_address_cancels_billing_and_releases() {
        let h = Harness::new();
        h.store().save_billing_profile("u1", "a@x.com", "sub_1").unwrap();
        set_outbound(&h.state, "u1", "a@x.com", Some("help@biz.com"))
            .await
            .unwrap();

        delete_address(&h.state, "u1", "A@x.com").await.unwrap();

        assert_eq!(*h.billing.cancelled.lock(), vec!["sub_1"]);
        assert_eq!(h.store().get_address("u1", "a@x.com").unwrap(), None);
        assert_eq!(h.store().domain_owner("biz.com").unwrap(), None);
        let relay = h.relay.state.lock();
        assert_eq!(relay.deleted_domains, vec!["biz.com"]);
        assert_eq!(relay.deleted_routes.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_address_survives_billing_failure() {
        let h = Harness::with(FakeBoard::new(), FakeRelay::new(), FakeBilling::failing());
        h.store().save_billing_profile("u1", "a@x.com", "sub_1").unwrap();

        delete_address(&h.state, "u1", "a@x.com").await.unwrap();
        assert_eq!(h.store().get_address("u1", "a@x.com").unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_unknown_address() {
        let h = Harness::new();
        let err = delete_address(&h.state, "u2", "a@x.com").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert!(h.store().get_address("u1", "a@x.com").unwrap().is_some());
    }
}
