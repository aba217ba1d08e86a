use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of migrations recorded as successfully applied.
pub async fn applied_count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{applied_count, run_pending, MIGRATOR};
    use crate::connect_with_settings;

    const MANAGED_SCHEMA_OBJECTS: &[&str] =
        &["conversation_session", "idx_conversation_session_updated_at"];

    #[tokio::test]
    async fn migrations_create_session_table() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for name in MANAGED_SCHEMA_OBJECTS {
            let count = sqlx::query("SELECT COUNT(*) AS count FROM sqlite_master WHERE name = ?")
                .bind(*name)
                .fetch_one(&pool)
                .await
                .expect("query schema")
                .get::<i64, _>("count");
            assert_eq!(count, 1, "missing schema object `{name}`");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent_and_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");
        assert_eq!(applied_count(&pool).await.expect("count"), MIGRATOR.iter().count() as i64);

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        let remaining = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE name = 'conversation_session'",
        )
        .fetch_one(&pool)
        .await
        .expect("query schema")
        .get::<i64, _>("count");
        assert_eq!(remaining, 0);
    }
}
