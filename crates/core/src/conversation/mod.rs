//! WhatsApp conversation state machine.
//!
//! The engine is pure: it maps `(session, inbound)` to a new session, an optional reply and an
//! ordered list of [`commands::Command`] for the host to execute. Host outcomes come back in as
//! [`commands::SystemEvent`]s.

pub mod commands;
pub mod engine;
pub mod render;
pub mod states;

pub use commands::{
    ArchiveMetadata, ArtifactRef, Command, CommandStage, EmailAttachment, Inbound, SystemEvent,
};
pub use engine::{ConversationEngine, ConversationError, EngineSettings, InputProblem, Transition};
pub use states::{ConversationId, ConversationState, CreationStep, PendingAction, Session};
