use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use vocario_core::config::EmailConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmailError {
    #[error("email delivery is disabled")]
    Disabled,
    #[error("email request failed: {0}")]
    Transport(String),
    #[error("email provider rejected message with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Public link of the archived document; the provider fetches it as an attachment.
    pub attachment: Option<RemoteAttachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteAttachment {
    pub filename: String,
    pub path: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

/// Used when email is switched off: every send fails so the user is told.
#[derive(Default)]
pub struct DisabledEmailSender;

#[async_trait]
impl EmailSender for DisabledEmailSender {
    async fn send(&self, _email: &OutgoingEmail) -> Result<(), EmailError> {
        Err(EmailError::Disabled)
    }
}

#[derive(Debug, Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<&'a RemoteAttachment>,
}

pub struct ResendEmailSender {
    client: Client,
    api_key: SecretString,
    from_address: String,
    api_base_url: String,
}

impl ResendEmailSender {
    pub fn from_config(config: &EmailConfig) -> Result<Self, EmailError> {
        let api_key = config.api_key.clone().ok_or(EmailError::Disabled)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| EmailError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            api_key,
            from_address: config.from_address.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let payload = ResendPayload {
            from: &self.from_address,
            to: [email.to.as_str()],
            subject: &email.subject,
            text: &email.body,
            attachments: email.attachment.iter().collect(),
        };
        let response = self
            .client
            .post(format!("{}/emails", self.api_base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|error| EmailError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail: String =
                response.text().await.unwrap_or_default().chars().take(200).collect();
            return Err(EmailError::Rejected { status: status.as_u16(), detail });
        }
        info!(event_name = "delivery.email.sent", subject = %email.subject, "email delivered");
        Ok(())
    }
}
