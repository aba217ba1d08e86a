use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use vocario_core::conversation::{ConversationId, Session};

use super::{RepositoryError, SessionStore};
use crate::DbPool;

/// Sessions stored as one JSON document per conversation.
pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn get(&self, id: &ConversationId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT payload_json
             FROM conversation_session
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn put(&self, id: &ConversationId, session: Session) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(&session)
            .map_err(|error| RepositoryError::Encode(error.to_string()))?;
        let document_count = i64::try_from(session.documents.len())
            .map_err(|error| RepositoryError::Encode(error.to_string()))?;
        let updated_at = session.updated_at.unwrap_or_else(Utc::now);

        sqlx::query(
            "INSERT INTO conversation_session (id, state, payload_json, document_count, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                payload_json = excluded.payload_json,
                document_count = excluded.document_count,
                updated_at = excluded.updated_at",
        )
        .bind(&id.0)
        .bind(session.state.name())
        .bind(payload_json)
        .bind(document_count)
        .bind(updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM conversation_session WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let payload_json: String = row.try_get("payload_json")?;
    serde_json::from_str(&payload_json).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use sqlx::Row;

    use vocario_core::conversation::{ConversationId, ConversationState, Session};
    use vocario_core::domain::document::{
        document_number, DocumentId, DocumentKind, DocumentRecord,
    };
    use vocario_core::domain::draft::{DraftDocument, LineItem, DEFAULT_VAT_RATE};

    use crate::migrations::run_pending;
    use crate::repositories::{RepositoryError, SessionStore, SqlSessionStore};
    use crate::{connect_with_settings, DbPool};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn session_with_quote(id: &ConversationId) -> Session {
        let mut session = Session::new(id.clone());
        let issued_on = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).single().expect("timestamp");
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        draft.client.name = Some("Dupont".to_string());
        draft.lines.push(LineItem::flat("Dépose cuisine", Decimal::new(350, 0)));
        let (document, sequence) = session.allocate_document();
        session.documents.push(DocumentRecord::from_draft(
            document.clone(),
            document_number(DocumentKind::Quote, issued_on.date_naive(), sequence),
            &draft,
            DEFAULT_VAT_RATE,
            issued_on.date_naive(),
        ));
        session.state = ConversationState::DocumentDetail {
            document,
            linked: Vec::new(),
            from_quote: None,
        };
        session.updated_at = Some(issued_on);
        session
    }

    #[tokio::test]
    async fn sql_session_round_trip() {
        let store = SqlSessionStore::new(pool().await);
        let id = ConversationId("33612345678".to_string());
        let session = session_with_quote(&id);

        store.put(&id, session.clone()).await.expect("put session");
        let found = store.get(&id).await.expect("get session");

        assert_eq!(found, Some(session));
    }

    #[tokio::test]
    async fn put_overwrites_and_tracks_state_name() {
        let pool = pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let id = ConversationId("33612345678".to_string());

        store.put(&id, Session::new(id.clone())).await.expect("first put");
        store.put(&id, session_with_quote(&id)).await.expect("second put");

        let row = sqlx::query(
            "SELECT COUNT(*) AS count, MAX(state) AS state, MAX(document_count) AS documents
             FROM conversation_session",
        )
        .fetch_one(&pool)
        .await
        .expect("query sessions");
        assert_eq!(row.get::<i64, _>("count"), 1);
        assert_eq!(row.get::<String, _>("state"), "document_detail");
        assert_eq!(row.get::<i64, _>("documents"), 1);

        let found = store.get(&id).await.expect("get session").expect("session exists");
        assert_eq!(found.documents[0].id, DocumentId("33612345678-1".to_string()));
    }

    #[tokio::test]
    async fn missing_and_deleted_sessions_read_as_none() {
        let store = SqlSessionStore::new(pool().await);
        let id = ConversationId("33700000000".to_string());
        assert_eq!(store.get(&id).await.expect("get session"), None);

        store.put(&id, Session::new(id.clone())).await.expect("put session");
        store.delete(&id).await.expect("delete session");

        assert_eq!(store.get(&id).await.expect("get session"), None);
        store.health_check().await.expect("pool is reachable");
    }

    #[tokio::test]
    async fn rows_with_unknown_states_read_as_decode_errors() {
        let pool = pool().await;
        let store = SqlSessionStore::new(pool.clone());
        let id = ConversationId("33612345678".to_string());
        store.put(&id, Session::new(id.clone())).await.expect("put session");

        let found = sqlx::query("SELECT payload_json FROM conversation_session WHERE id = ?")
            .bind(&id.0)
            .fetch_one(&pool)
            .await
            .expect("read row");
        let payload = found
            .get::<String, _>("payload_json")
            .replace("\"main_menu\"", "\"devis_photo\"");
        sqlx::query("UPDATE conversation_session SET payload_json = ? WHERE id = ?")
            .bind(payload)
            .bind(&id.0)
            .execute(&pool)
            .await
            .expect("rewrite row");

        assert!(matches!(store.get(&id).await, Err(RepositoryError::Decode(_))));
    }
}
