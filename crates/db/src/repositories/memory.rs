use std::collections::HashMap;

use tokio::sync::RwLock;

use vocario_core::conversation::{ConversationId, Session};

use super::{RepositoryError, SessionStore};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<ConversationId, Session>>,
}

impl InMemorySessionStore {
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &ConversationId) -> Result<Option<Session>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn put(&self, id: &ConversationId, session: Session) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vocario_core::conversation::{ConversationId, ConversationState, CreationStep, Session};
    use vocario_core::domain::document::DocumentKind;
    use vocario_core::domain::draft::DraftDocument;

    use crate::repositories::{InMemorySessionStore, SessionStore};

    #[tokio::test]
    async fn in_memory_session_round_trip() {
        let store = InMemorySessionStore::default();
        let id = ConversationId("33612345678".to_string());
        let mut session = Session::new(id.clone());
        session.state = ConversationState::CreatingDocument(CreationStep::ClientName);
        session.draft = Some(DraftDocument::new(DocumentKind::Quote));

        store.put(&id, session.clone()).await.expect("put session");
        let found = store.get(&id).await.expect("get session");

        assert_eq!(found, Some(session));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn deleted_sessions_are_gone() {
        let store = InMemorySessionStore::default();
        let id = ConversationId("33700000000".to_string());
        store.put(&id, Session::new(id.clone())).await.expect("put session");

        store.delete(&id).await.expect("delete session");

        assert_eq!(store.get(&id).await.expect("get session"), None);
        assert!(store.is_empty().await);
    }
}
