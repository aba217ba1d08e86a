use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dedup::MessageDeduplicator;
use crate::webhook::{mask_phone, parse_webhook, InboundEnvelope, TwilioWebhook, WebhookError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("session storage failure: {0}")]
    Storage(String),
    #[error("message handler failure: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    Accepted(HandlerResult),
    Duplicate,
}

/// Consumer of inbound messages; the server's conversation host is the production one.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, HandlerError>;
}

/// Drops every message; lets the webhook run before a host is wired.
#[derive(Default)]
pub struct IgnoreAllHandler;

#[async_trait]
impl MessageHandler for IgnoreAllHandler {
    async fn handle(
        &self,
        _envelope: &InboundEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, HandlerError> {
        Ok(HandlerResult::Ignored)
    }
}

/// Webhook front door: unwraps the provider payload, drops redelivered messages and hands the
/// rest to the handler.
pub struct WebhookIngress {
    handler: Arc<dyn MessageHandler>,
    dedup: MessageDeduplicator,
}

impl WebhookIngress {
    pub fn new(handler: Arc<dyn MessageHandler>, dedup_window_secs: u64) -> Self {
        Self { handler, dedup: MessageDeduplicator::new(dedup_window_secs) }
    }

    pub async fn receive(
        &self,
        payload: &TwilioWebhook,
        received_at: DateTime<Utc>,
    ) -> Result<IngressOutcome, IngressError> {
        let envelope = parse_webhook(payload, received_at).map_err(|error| {
            warn!(event_name = "ingress.whatsapp.rejected", error = %error, "invalid webhook");
            error
        })?;
        let correlation_id = envelope.correlation_id();

        if let Some(sid) = envelope.message_sid.as_deref() {
            if !self.dedup.first_seen(sid, received_at).await {
                debug!(
                    event_name = "ingress.whatsapp.duplicate",
                    correlation_id = %correlation_id,
                    from = %mask_phone(&envelope.conversation.0),
                    "dropping redelivered message"
                );
                return Ok(IngressOutcome::Duplicate);
            }
        }

        info!(
            event_name = "ingress.whatsapp.message_received",
            correlation_id = %correlation_id,
            conversation_id = %mask_phone(&envelope.conversation.0),
            chars = envelope.text.chars().count(),
            "received whatsapp message"
        );

        let context = EventContext { correlation_id };
        match self.handler.handle(&envelope, &context).await {
            Ok(result) => Ok(IngressOutcome::Accepted(result)),
            Err(error) => {
                warn!(
                    event_name = "ingress.whatsapp.handler_failed",
                    correlation_id = %context.correlation_id,
                    error = %error,
                    "message handler failed"
                );
                if let Some(sid) = envelope.message_sid.as_deref() {
                    self.dedup.forget(sid).await;
                }
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    use super::{
        EventContext, HandlerError, HandlerResult, IgnoreAllHandler, IngressError, IngressOutcome,
        MessageHandler, WebhookIngress,
    };
    use crate::webhook::{InboundEnvelope, TwilioWebhook};

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(
            &self,
            envelope: &InboundEnvelope,
            ctx: &EventContext,
        ) -> Result<HandlerResult, HandlerError> {
            self.seen.lock().await.push((envelope.text.clone(), ctx.correlation_id.clone()));
            Ok(HandlerResult::Processed)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(
            &self,
            _envelope: &InboundEnvelope,
            _ctx: &EventContext,
        ) -> Result<HandlerResult, HandlerError> {
            Err(HandlerError::Storage("database is locked".to_owned()))
        }
    }

    fn message(sid: &str, body: &str) -> TwilioWebhook {
        TwilioWebhook {
            from: "whatsapp:+33612345678".to_owned(),
            body: body.to_owned(),
            message_sid: Some(sid.to_owned()),
            ..TwilioWebhook::default()
        }
    }

    #[tokio::test]
    async fn messages_reach_the_handler_with_their_sid_as_correlation() {
        let handler = Arc::new(RecordingHandler::default());
        let ingress = WebhookIngress::new(handler.clone(), 300);

        let outcome = ingress.receive(&message("SM1", "1"), Utc::now()).await.expect("receive");

        assert_eq!(outcome, IngressOutcome::Accepted(HandlerResult::Processed));
        assert_eq!(*handler.seen.lock().await, vec![("1".to_owned(), "SM1".to_owned())]);
    }

    #[tokio::test]
    async fn redelivered_messages_are_processed_once() {
        let handler = Arc::new(RecordingHandler::default());
        let ingress = WebhookIngress::new(handler.clone(), 300);
        let now = Utc::now();

        ingress.receive(&message("SM1", "1"), now).await.expect("first");
        let second = ingress.receive(&message("SM1", "1"), now).await.expect("second");

        assert_eq!(second, IngressOutcome::Duplicate);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn handler_failures_surface_to_the_caller() {
        let ingress = WebhookIngress::new(Arc::new(FailingHandler), 300);
        let error = ingress.receive(&message("SM1", "menu"), Utc::now()).await;

        assert!(matches!(error, Err(IngressError::Handler(HandlerError::Storage(_)))));
    }

    #[tokio::test]
    async fn failed_messages_are_retried_by_the_provider() {
        let ingress = WebhookIngress::new(Arc::new(FailingHandler), 300);
        let now = Utc::now();

        let first = ingress.receive(&message("SM1", "menu"), now).await;
        let retry = ingress.receive(&message("SM1", "menu"), now).await;

        assert!(first.is_err());
        assert!(matches!(retry, Err(IngressError::Handler(_))));
    }

    #[tokio::test]
    async fn invalid_senders_never_reach_the_handler() {
        let ingress = WebhookIngress::new(Arc::new(IgnoreAllHandler), 300);
        let mut payload = message("SM1", "menu");
        payload.from = String::new();

        let error = ingress.receive(&payload, Utc::now()).await;
        assert!(matches!(error, Err(IngressError::Webhook(_))));
    }
}
