use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vocario_core::config::WhatsAppConfig;
use vocario_core::ConversationId;

use crate::message::{split_reply, MAX_BODY_CHARS};
use crate::retry::RetryPolicy;
use crate::webhook::{channel_address, mask_phone};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery channel is not configured")]
    NotConfigured,
    #[error("delivery request failed: {0}")]
    Transport(String),
    #[error("provider rejected message with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

impl DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::NotConfigured => false,
        }
    }
}

/// Outbound half of the messaging channel. Replies are fire-and-forget for the conversation:
/// callers log failures but never feed them back into the session.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, to: &ConversationId, text: &str) -> Result<(), DeliveryError>;
}

/// Used when WhatsApp is disabled: replies are only logged.
#[derive(Default)]
pub struct NoopDelivery;

#[async_trait]
impl DeliveryChannel for NoopDelivery {
    async fn send(&self, to: &ConversationId, text: &str) -> Result<(), DeliveryError> {
        debug!(
            event_name = "delivery.whatsapp.skipped",
            to = %mask_phone(&to.0),
            chars = text.chars().count(),
            "whatsapp disabled; reply not sent"
        );
        Ok(())
    }
}

/// Keeps every reply in memory, in send order.
#[derive(Default)]
pub struct InMemoryDelivery {
    sent: Mutex<Vec<(ConversationId, String)>>,
}

impl InMemoryDelivery {
    pub async fn sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn replies_to(&self, to: &ConversationId) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(recipient, _)| recipient == to)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for InMemoryDelivery {
    async fn send(&self, to: &ConversationId, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().await.push((to.clone(), text.to_owned()));
        Ok(())
    }
}

/// Twilio Messages API client.
pub struct TwilioDelivery {
    client: Client,
    account_sid: String,
    auth_token: SecretString,
    sender: String,
    api_base_url: String,
    retry: RetryPolicy,
}

impl TwilioDelivery {
    pub fn from_config(config: &WhatsAppConfig) -> Result<Self, DeliveryError> {
        if config.account_sid.trim().is_empty() || config.sender.trim().is_empty() {
            return Err(DeliveryError::NotConfigured);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            sender: config.sender.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/2010-04-01/Accounts/{}/Messages.json", self.api_base_url, self.account_sid)
    }

    async fn post_body(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let from = channel_address(&self.sender);
        let form = [("From", from.as_str()), ("To", to), ("Body", body)];
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|error| DeliveryError::Transport(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            detail: detail.chars().take(200).collect(),
        })
    }

    async fn post_with_retry(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            match self.post_body(to, body).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && attempt < self.retry.max_retries => {
                    warn!(
                        event_name = "delivery.whatsapp.retry",
                        attempt,
                        error = %error,
                        "transient twilio failure; retrying"
                    );
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl DeliveryChannel for TwilioDelivery {
    async fn send(&self, to: &ConversationId, text: &str) -> Result<(), DeliveryError> {
        let address = channel_address(&to.0);
        let parts = split_reply(text, MAX_BODY_CHARS);
        for part in &parts {
            self.post_with_retry(&address, part).await?;
        }
        info!(
            event_name = "delivery.whatsapp.sent",
            to = %mask_phone(&to.0),
            parts = parts.len(),
            "whatsapp reply delivered"
        );
        Ok(())
    }
}
