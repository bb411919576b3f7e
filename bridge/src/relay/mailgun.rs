//! Mailgun REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use super::{DnsRecord, MailRelay, OutboundMessage, RelayError};
use crate::address::normalize_message_id;
use crate::config::Config;

/// Priority of the forwarding route created for custom outbound addresses.
const ROUTE_PRIORITY: &str = "64";

pub struct MailgunClient {
    client: Client,
    api_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Deserialize)]
struct ApiRecord {
    record_type: String,
    #[serde(default)]
    name: Option<String>,
    value: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    valid: String,
}

impl From<ApiRecord> for DnsRecord {
    fn from(r: ApiRecord) -> Self {
        DnsRecord {
            record_type: r.record_type,
            name: r.name.unwrap_or_default(),
            value: r.value,
            priority: r.priority,
            valid: r.valid == "valid",
        }
    }
}

#[derive(Deserialize)]
struct DomainResponse {
    #[serde(default)]
    receiving_dns_records: Vec<ApiRecord>,
    #[serde(default)]
    sending_dns_records: Vec<ApiRecord>,
}

#[derive(Deserialize)]
struct RouteResponse {
    route: Route,
}

#[derive(Deserialize)]
struct Route {
    id: String,
}

impl MailgunClient {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        Self::new(
            &config.mailgun_api_url,
            &config.mailgun_api_key,
            config.request_timeout(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Stored messages live on the API host or one of Mailgun's storage hosts.
    fn is_relay_url(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let api_host = Url::parse(&self.api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        url.scheme() == "https"
            && (api_host.as_deref() == Some(host)
                || host == "mailgun.net"
                || host.ends_with(".mailgun.net"))
    }

    async fn send_request(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Response, RelayError> {
        let resp = request.basic_auth("api", Some(&self.api_key)).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(what = what, status = status.as_u16(), body = %body, "mailgun_request_failed");
            return Err(RelayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

/// Form fields for the messages endpoint.
fn message_form(message: &OutboundMessage) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("from", message.from_header()),
        ("subject", message.subject.clone()),
        ("text", message.text.clone()),
    ];
    for to in &message.to {
        form.push(("to", to.clone()));
    }
    if let Some(html) = &message.html {
        form.push(("html", html.clone()));
    }
    if let Some(tracking) = &message.tracking {
        if let Some(reply_to) = &message.reply_to {
            form.push(("h:Reply-To", reply_to.clone()));
        }
        if let Some(in_reply_to) = &message.in_reply_to {
            let id = format!("<{}>", normalize_message_id(in_reply_to));
            form.push(("h:In-Reply-To", id.clone()));
            form.push(("h:References", id));
        }
        form.push(("o:tag", message.from.clone()));
        form.push(("v:card", tracking.card.clone()));
        form.push(("v:commenter", tracking.commenter.clone()));
        form.push(("o:tracking-clicks", "no".to_string()));
        form.push(("o:tracking-opens", "no".to_string()));
    }
    form
}

#[async_trait]
impl MailRelay for MailgunClient {
    async fn send(&self, domain: &str, message: &OutboundMessage) -> Result<String, RelayError> {
        let request = self
            .client
            .post(self.url(&format!("/{domain}/messages")))
            .form(&message_form(message));
        let resp = self.send_request(request, &format!("domain {domain}")).await?;
        let sent: SendResponse = resp.json().await?;
        let id = normalize_message_id(&sent.id);
        info!(domain = %domain, message_id = %id, recipients = message.to.len(), "mailgun_message_sent");
        Ok(id)
    }

    async fn domain_records(&self, domain: &str) -> Result<Vec<DnsRecord>, RelayError> {
        let request = self.client.get(self.url(&format!("/domains/{domain}")));
        let resp = self.send_request(request, &format!("domain {domain}")).await?;
        let body: DomainResponse = resp.json().await?;
        Ok(body
            .sending_dns_records
            .into_iter()
            .chain(body.receiving_dns_records)
            .map(DnsRecord::from)
            .collect())
    }

    async fn create_domain(&self, domain: &str) -> Result<(), RelayError> {
        let request = self.client.post(self.url("/domains")).form(&[
            ("name", domain),
            ("spam_action", "delete"),
            ("wildcard", "false"),
        ]);
        self.send_request(request, &format!("domain {domain}")).await?;
        info!(domain = %domain, "mailgun_domain_created");
        Ok(())
    }

    async fn delete_domain(&self, domain: &str) -> Result<(), RelayError> {
        let request = self.client.delete(self.url(&format!("/domains/{domain}")));
        self.send_request(request, &format!("domain {domain}")).await?;
        info!(domain = %domain, "mailgun_domain_deleted");
        Ok(())
    }

    async fn create_route(&self, outbound: &str, inbound: &str) -> Result<String, RelayError> {
        let expression = format!("match_recipient(\"{outbound}\")");
        let forward = format!("forward(\"{inbound}\")");
        let request = self.client.post(self.url("/routes")).form(&[
            ("priority", ROUTE_PRIORITY),
            ("description", "External inbound address."),
            ("expression", expression.as_str()),
            ("action", forward.as_str()),
            ("action", "stop()"),
        ]);
        let resp = self.send_request(request, "routes").await?;
        let created: RouteResponse = resp.json().await?;
        Ok(created.route.id)
    }

    async fn delete_route(&self, route_id: &str) -> Result<(), RelayError> {
        let request = self.client.delete(self.url(&format!("/routes/{route_id}")));
        self.send_request(request, &format!("route {route_id}")).await?;
        Ok(())
    }

    async fn create_webhook(
        &self,
        domain: &str,
        event: &str,
        url: &str,
    ) -> Result<(), RelayError> {
        let request = self
            .client
            .post(self.url(&format!("/domains/{domain}/webhooks")))
            .form(&[("id", event), ("url", url)]);
        self.send_request(request, &format!("domain {domain}")).await?;
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RelayError> {
        if !self.is_relay_url(url) {
            warn!(url = %url, "mailgun_fetch_untrusted");
            return Err(RelayError::Untrusted(url.to_string()));
        }
        let resp = self.send_request(self.client.get(url), url).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}
