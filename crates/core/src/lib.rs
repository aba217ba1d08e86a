pub mod audit;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod parsing;

pub use conversation::{
    Command, ConversationEngine, ConversationError, ConversationId, ConversationState,
    EngineSettings, Inbound, Session, SystemEvent, Transition,
};
pub use domain::document::{DocumentFormat, DocumentId, DocumentKind, DocumentRecord};
pub use domain::draft::{DraftDocument, LineItem, Unit};
pub use errors::{ApplicationError, DomainError, InterfaceError};
