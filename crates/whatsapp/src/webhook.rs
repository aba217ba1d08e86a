use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
pub use vocario_core::domain::contact::mask_phone;
use vocario_core::ConversationId;

const CHANNEL_PREFIX: &str = "whatsapp:";

/// Form body Twilio posts to the messaging webhook. Only the fields the conversation needs are
/// kept; everything else Twilio sends is ignored by the deserializer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TwilioWebhook {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub message_sid: Option<String>,
    #[serde(default)]
    pub sms_message_sid: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub button_payload: Option<String>,
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub num_media: Option<String>,
}

impl TwilioWebhook {
    pub fn message_sid(&self) -> Option<&str> {
        self.message_sid
            .as_deref()
            .or(self.sms_message_sid.as_deref())
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
    }

    fn text(&self) -> &str {
        let button = self
            .button_payload
            .as_deref()
            .or(self.button_text.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        button.unwrap_or_else(|| self.body.trim())
    }
}

/// Transport-free inbound message: who wrote, what they wrote, and when it arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub message_sid: Option<String>,
    pub conversation: ConversationId,
    pub text: String,
    pub profile_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundEnvelope {
    /// Correlation id for logs: the provider message id when present.
    pub fn correlation_id(&self) -> String {
        self.message_sid
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.conversation, self.received_at.timestamp()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook payload has no sender")]
    MissingSender,
    #[error("webhook sender `{0}` is not a phone number")]
    InvalidSender(String),
}

pub fn parse_webhook(
    payload: &TwilioWebhook,
    received_at: DateTime<Utc>,
) -> Result<InboundEnvelope, WebhookError> {
    let raw_sender = payload.from.trim();
    if raw_sender.is_empty() {
        return Err(WebhookError::MissingSender);
    }
    let phone = normalize_phone(raw_sender);
    if phone.is_empty() || !phone.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(WebhookError::InvalidSender(mask_phone(raw_sender)));
    }

    Ok(InboundEnvelope {
        message_sid: payload.message_sid().map(str::to_owned),
        conversation: ConversationId(phone),
        text: payload.text().to_owned(),
        profile_name: payload
            .profile_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned),
        received_at,
    })
}

/// `whatsapp:+33612345678` → `33612345678`.
pub fn normalize_phone(raw: &str) -> String {
    raw.replace(CHANNEL_PREFIX, "").replace('+', "").trim().to_owned()
}

/// Inverse of [`normalize_phone`] for outbound addressing.
pub fn channel_address(phone: &str) -> String {
    let phone = phone.trim();
    if phone.starts_with(CHANNEL_PREFIX) {
        return phone.to_owned();
    }
    if phone.starts_with('+') {
        format!("{CHANNEL_PREFIX}{phone}")
    } else {
        format!("{CHANNEL_PREFIX}+{phone}")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{channel_address, normalize_phone, parse_webhook, TwilioWebhook, WebhookError};

    fn payload(from: &str, body: &str) -> TwilioWebhook {
        TwilioWebhook {
            from: from.to_owned(),
            body: body.to_owned(),
            message_sid: Some("SM0001".to_owned()),
            ..TwilioWebhook::default()
        }
    }

    #[test]
    fn phone_normalization_strips_channel_prefix_and_plus() {
        assert_eq!(normalize_phone("whatsapp:+33612345678"), "33612345678");
        assert_eq!(normalize_phone(" +33612345678 "), "33612345678");
        assert_eq!(normalize_phone("33612345678"), "33612345678");
    }

    #[test]
    fn channel_address_restores_the_prefix() {
        assert_eq!(channel_address("33612345678"), "whatsapp:+33612345678");
        assert_eq!(channel_address("+33612345678"), "whatsapp:+33612345678");
        assert_eq!(channel_address("whatsapp:+33612345678"), "whatsapp:+33612345678");
    }

    #[test]
    fn parsing_trims_body_and_keeps_message_sid() {
        let received_at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().expect("timestamp");
        let envelope =
            parse_webhook(&payload("whatsapp:+33612345678", "  1 \n"), received_at).expect("parse");

        assert_eq!(envelope.conversation.0, "33612345678");
        assert_eq!(envelope.text, "1");
        assert_eq!(envelope.message_sid.as_deref(), Some("SM0001"));
        assert_eq!(envelope.correlation_id(), "SM0001");
    }

    #[test]
    fn button_payload_takes_precedence_over_body() {
        let mut webhook = payload("whatsapp:+33612345678", "Nouveau devis");
        webhook.button_payload = Some("1".to_owned());

        let envelope = parse_webhook(&webhook, Utc::now()).expect("parse");
        assert_eq!(envelope.text, "1");
    }

    #[test]
    fn sms_sid_is_used_when_message_sid_is_absent() {
        let mut webhook = payload("whatsapp:+33612345678", "menu");
        webhook.message_sid = None;
        webhook.sms_message_sid = Some("SM0002".to_owned());

        assert_eq!(webhook.message_sid(), Some("SM0002"));
    }

    #[test]
    fn senders_must_be_phone_numbers() {
        assert_eq!(
            parse_webhook(&payload("  ", "menu"), Utc::now()),
            Err(WebhookError::MissingSender)
        );
        assert!(matches!(
            parse_webhook(&payload("whatsapp:+33abc", "menu"), Utc::now()),
            Err(WebhookError::InvalidSender(_))
        ));
    }
}
