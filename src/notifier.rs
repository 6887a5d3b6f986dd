//! Webhook implementation of [`Notifier`]
//!
//! Posts each [`Envelope`] as JSON to a configured endpoint, which is expected to turn it
//! into an email (or any other delivery).

use crate::collaborators::{Envelope, Notifier};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Webhook endpoint settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint URL
    pub url: String,

    /// Value of the `Authorization` header, if the endpoint needs one
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Delivers envelopes by HTTP POST
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    /// Create a notifier for `config`
    pub fn new(config: WebhookConfig) -> Result<Self> {
        url::Url::parse(&config.url)
            .map_err(|e| Error::config(format!("invalid webhook url: {}", e), "notifier.url"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, envelope: &Envelope) -> Result<bool> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut request = self
            .client
            .post(&self.config.url)
            .json(envelope)
            .timeout(timeout);

        if let Some(auth) = &self.config.auth_header {
            request = request.header("Authorization", auth);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                Error::Transient(format!(
                    "notifier did not answer within {} seconds",
                    timeout.as_secs()
                ))
            })??;

        if response.status().is_success() {
            tracing::debug!(to = %envelope.to, entries = envelope.entries.len(), "message sent");
            Ok(true)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                to = %envelope.to,
                status = %status,
                body = %body,
                "notifier rejected message"
            );
            Ok(false)
        }
    }
}
