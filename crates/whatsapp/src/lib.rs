//! WhatsApp Integration - Twilio webhook ingress and reply delivery
//!
//! This crate is the messaging edge of vocario:
//! - **Webhook** (`webhook`) - Twilio form payloads, phone normalization and masking
//! - **Ingress** (`ingress`) - de-duplicated hand-off of inbound messages to a `MessageHandler`
//! - **Delivery** (`delivery`) - `DeliveryChannel` trait with Twilio, no-op and in-memory senders
//! - **Message** (`message`) - splitting long replies under the provider body limit
//!
//! # Architecture
//!
//! ```text
//! Twilio webhook → WebhookIngress → MessageHandler → Conversation Engine
//!                                          ↓
//!                       DeliveryChannel ← reply text
//! ```

pub mod dedup;
pub mod delivery;
pub mod ingress;
pub mod message;
pub mod retry;
pub mod webhook;

pub use delivery::{DeliveryChannel, DeliveryError, InMemoryDelivery, NoopDelivery, TwilioDelivery};
pub use ingress::{
    EventContext, HandlerError, HandlerResult, IngressError, IngressOutcome, MessageHandler,
    WebhookIngress,
};
pub use retry::RetryPolicy;
pub use webhook::{mask_phone, normalize_phone, InboundEnvelope, TwilioWebhook, WebhookError};
