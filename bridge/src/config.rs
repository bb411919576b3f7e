//! Configuration module for environment variable parsing.
//!
//! Every setting has a default so the server can boot in development with an
//! empty environment; provider credentials simply stay blank until set.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Domain every inbound address lives under (e.g. `boardthreads.com`)
    pub base_domain: String,

    /// Public URL of this service, used to build webhook callback URLs
    pub service_url: String,

    // =========================================================================
    // Board provider
    // =========================================================================
    pub trello_api_key: String,

    pub trello_bot_token: String,

    /// Member id of the integration bot; events it authored are ignored
    pub trello_bot_id: String,

    // =========================================================================
    // Mail relay
    // =========================================================================
    pub mailgun_api_key: String,

    pub mailgun_api_url: String,

    /// Mailgun signing key for HMAC signature verification
    pub mailgun_signing_key: Option<String>,

    /// Maximum age in seconds for Mailgun webhook timestamps
    pub mailgun_signature_max_age: u64,

    /// Shared secret expected in `X-Custom-Auth` on the raw MIME endpoint
    pub cloudflare_auth_token: Option<String>,

    /// Bearer token of the address management API; the API is closed when unset
    pub api_token: Option<String>,

    // =========================================================================
    // Billing
    // =========================================================================
    pub billing_api_url: Option<String>,

    pub billing_api_token: Option<String>,

    /// Root directory of the attachment de-duplication cache
    pub attachment_cache_dir: PathBuf,

    /// HTTP request timeout in milliseconds, applied to every provider call
    pub request_timeout_ms: u64,

    /// Comment prefixes meaning "send this comment as an email"
    pub marker_prefixes: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("boardmail.db")),

            base_domain: env::var("BASE_DOMAIN")
                .map(|d| d.trim().to_lowercase())
                .unwrap_or_else(|_| "boardthreads.com".to_string()),

            service_url: env::var("SERVICE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),

            trello_api_key: env::var("TRELLO_API_KEY").unwrap_or_default(),

            trello_bot_token: env::var("TRELLO_BOT_TOKEN").unwrap_or_default(),

            trello_bot_id: env::var("TRELLO_BOT_ID").unwrap_or_default(),

            mailgun_api_key: env::var("MAILGUN_API_KEY").unwrap_or_default(),

            mailgun_api_url: env::var("MAILGUN_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://api.mailgun.net/v3".to_string()),

            mailgun_signing_key: env::var("MAILGUN_SIGNING_KEY").ok(),

            mailgun_signature_max_age: env::var("MAILGUN_SIGNATURE_MAX_AGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300), // 5 minutes default

            cloudflare_auth_token: env::var("CLOUDFLARE_AUTH_TOKEN").ok(),

            api_token: env::var("API_TOKEN").ok().filter(|t| !t.trim().is_empty()),

            billing_api_url: env::var("BILLING_API_URL").ok(),

            billing_api_token: env::var("BILLING_API_TOKEN").ok(),

            attachment_cache_dir: env::var("ATTACHMENT_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/boardmail/cache")),

            request_timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),

            marker_prefixes: parse_csv("MARKER_PREFIXES")
                .filter(|m| !m.is_empty())
                .unwrap_or_else(default_markers),
        }
    }

    /// Timeout for outbound provider calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Callback URL the board provider posts card events to.
    pub fn card_webhook_url(&self) -> String {
        format!("{}/webhooks/trello/card", self.service_url)
    }

    /// Callback URLs the relay posts delivery results to, as (delivered, failed).
    pub fn delivery_webhook_urls(&self) -> (String, String) {
        (
            format!("{}/webhooks/mailgun/success", self.service_url),
            format!("{}/webhooks/mailgun/failure", self.service_url),
        )
    }
}

impl Default for Config {
    /// Development defaults, identical to `from_env` with an empty environment.
    fn default() -> Self {
        Config {
            port: 8080,
            database_path: PathBuf::from("boardmail.db"),
            base_domain: "boardthreads.com".to_string(),
            service_url: "http://localhost:8080".to_string(),
            trello_api_key: String::new(),
            trello_bot_token: String::new(),
            trello_bot_id: String::new(),
            mailgun_api_key: String::new(),
            mailgun_api_url: "https://api.mailgun.net/v3".to_string(),
            mailgun_signing_key: None,
            mailgun_signature_max_age: 300,
            cloudflare_auth_token: None,
            api_token: None,
            billing_api_url: None,
            billing_api_token: None,
            attachment_cache_dir: PathBuf::from("/tmp/boardmail/cache"),
            request_timeout_ms: 8000,
            marker_prefixes: default_markers(),
        }
    }
}

fn default_markers() -> Vec<String> {
    vec![
        ":email:".to_string(),
        ":e-mail:".to_string(),
        ":envelope:".to_string(),
    ]
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        let items: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            warn!(env_var = name, value = %raw, "Empty list, using default");
        }
        items
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv() {
        env::set_var("TEST_MARKERS_CSV", ":email:, :mail: ,");
        let result = parse_csv("TEST_MARKERS_CSV");
        assert_eq!(
            result,
            Some(vec![":email:".to_string(), ":mail:".to_string()])
        );
        env::remove_var("TEST_MARKERS_CSV");
    }

    #[test]
    fn test_parse_csv_missing() {
        assert_eq!(parse_csv("NONEXISTENT_MARKERS_VAR"), None);
    }

    #[test]
    fn test_callback_urls() {
        let config = Config {
            service_url: "https://bridge.example.com".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.card_webhook_url(),
            "https://bridge.example.com/webhooks/trello/card"
        );
        let (ok, failed) = config.delivery_webhook_urls();
        assert!(ok.ends_with("/webhooks/mailgun/success"));
        assert!(failed.ends_with("/webhooks/mailgun/failure"));
    }
}
