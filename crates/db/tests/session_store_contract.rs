use rust_decimal::Decimal;

use vocario_core::conversation::{ConversationId, ConversationState, CreationStep, Session};
use vocario_core::domain::document::DocumentKind;
use vocario_core::domain::draft::{DraftDocument, LineItem};
use vocario_db::{
    connect_with_settings, migrations, InMemorySessionStore, SessionStore, SqlSessionStore,
};

async fn sql_store() -> SqlSessionStore {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");
    SqlSessionStore::new(pool)
}

fn drafting(id: &ConversationId) -> Session {
    let mut session = Session::new(id.clone());
    let mut draft = DraftDocument::new(DocumentKind::Invoice);
    draft.client.name = Some("Martin".to_string());
    draft.lines.push(LineItem::flat("Pose parquet", Decimal::new(1_250, 0)));
    session.draft = Some(draft);
    session.state = ConversationState::CreatingDocument(CreationStep::LineItemsReview);
    session
}

/// Behaviour every session store must share: absent ids read as `None`, puts overwrite, deletes
/// are idempotent and sessions never leak across numbers.
async fn assert_contract(store: &dyn SessionStore) {
    let first = ConversationId("33612345678".to_string());
    let second = ConversationId("33798765432".to_string());

    assert_eq!(store.get(&first).await.expect("get missing"), None);

    store.put(&first, Session::new(first.clone())).await.expect("put");
    let drafting = drafting(&first);
    store.put(&first, drafting.clone()).await.expect("overwrite");
    assert_eq!(store.get(&first).await.expect("get"), Some(drafting));
    assert_eq!(store.get(&second).await.expect("get other"), None);

    store.delete(&first).await.expect("delete");
    store.delete(&first).await.expect("delete again");
    assert_eq!(store.get(&first).await.expect("get deleted"), None);

    store.health_check().await.expect("healthy");
}

#[tokio::test]
async fn in_memory_store_honours_the_contract() {
    assert_contract(&InMemorySessionStore::default()).await;
}

#[tokio::test]
async fn sqlite_store_honours_the_contract() {
    assert_contract(&sql_store().await).await;
}
