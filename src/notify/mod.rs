//! Telegram notifications: best-effort outbound messages.
//!
//! Missing credentials downgrade to a disabled notifier instead of an
//! abort; delivery failures are logged and swallowed so they can never
//! propagate into the trading path.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde_json::json;

pub type SharedNotifier = Arc<Notifier>;

pub struct Notifier {
    token: String,
    chat_id: String,
    enabled: bool,
    client: Client,
}

impl Notifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        let enabled = token.is_some() && chat_id.is_some();
        if !enabled {
            warn!("Notifier disabled (no Telegram credentials)");
        }
        Self {
            token: token.unwrap_or_default(),
            chat_id: chat_id.unwrap_or_default(),
            enabled,
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// No-op notifier for tests and credential-less deployments.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Send a message. Urgent messages get a siren prefix and bypass the
    /// muted-notification flag. Returns true on confirmed delivery.
    pub async fn send(&self, message: &str, urgent: bool) -> bool {
        if !self.enabled {
            return false;
        }

        let text = if urgent {
            format!("🚨 {}", strip_markup(message))
        } else {
            strip_markup(message)
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_notification": !urgent,
            }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Telegram send rejected: HTTP {}", response.status());
                false
            }
            Err(e) => {
                debug!("Telegram send failed: {e}");
                false
            }
        }
    }
}

/// Strip simple HTML-like markup (`<b>`, `</i>`, ...) for the plain-text
/// transport. Unbalanced `<` survives untouched.
fn strip_markup(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(open) = rest.find('<') {
        match rest[open..].find('>') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}
