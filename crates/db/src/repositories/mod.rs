use async_trait::async_trait;
use thiserror::Error;

use vocario_core::conversation::{ConversationId, Session};

pub mod memory;
pub mod session;

pub use memory::InMemorySessionStore;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Persistence for per-conversation sessions, keyed by the normalized phone number.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &ConversationId) -> Result<Option<Session>, RepositoryError>;
    async fn put(&self, id: &ConversationId, session: Session) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &ConversationId) -> Result<(), RepositoryError>;

    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
