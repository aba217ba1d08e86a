use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use vocario_agent::{
    DisabledExtractor, HttpLlmClient, LineItemExtraction, LlmLineItemExtractor,
};
use vocario_core::audit::TracingAuditSink;
use vocario_core::config::{AppConfig, ConfigError, LoadOptions};
use vocario_core::ConversationEngine;
use vocario_db::{connect_with_settings, migrations, DbPool, SessionStore, SqlSessionStore};
use vocario_whatsapp::{
    DeliveryChannel, DeliveryError, NoopDelivery, RetryPolicy, TwilioDelivery, WebhookIngress,
};

use crate::archive::LocalArchive;
use crate::builder::{BuildError, DocumentBuilder, TeraDocumentBuilder};
use crate::email::{DisabledEmailSender, EmailError, EmailSender, ResendEmailSender};
use crate::executor::{CommandExecutor, ExecutorSettings};
use crate::host::ConversationHost;
use crate::routes::AppState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub sessions: Arc<dyn SessionStore>,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("document templates could not be loaded: {0}")]
    Templates(#[source] BuildError),
    #[error("whatsapp delivery could not be configured: {0}")]
    Delivery(#[source] DeliveryError),
    #[error("email delivery could not be configured: {0}")]
    Email(#[source] EmailError),
    #[error("llm client could not be configured: {0}")]
    Llm(#[source] anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let sessions: Arc<dyn SessionStore> = Arc::new(SqlSessionStore::new(db_pool.clone()));
    let builder = document_builder(&config)?;
    let executor = CommandExecutor::new(
        builder.clone(),
        Arc::new(LocalArchive::new(
            config.documents.archive_dir.clone(),
            &config.documents.public_base_url,
        )),
        email_sender(&config)?,
        line_item_extractor(&config)?,
        ExecutorSettings {
            call_timeout: Duration::from_secs(config.documents.build_timeout_secs),
            store_retry: RetryPolicy::new(config.documents.store_retries),
        },
    );
    let host = ConversationHost::new(
        ConversationEngine::new(config.engine_settings()),
        sessions.clone(),
        delivery_channel(&config)?,
        executor,
        Arc::new(TracingAuditSink),
    );
    let ingress = WebhookIngress::new(Arc::new(host), config.server.dedup_window_secs);

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        whatsapp = config.whatsapp.enabled,
        email = config.email.enabled,
        line_item_extraction = config.llm.line_item_extraction,
        "application wired"
    );

    Ok(Application {
        state: AppState { ingress: Arc::new(ingress), builder },
        config,
        db_pool,
        sessions,
    })
}

fn document_builder(config: &AppConfig) -> Result<Arc<dyn DocumentBuilder>, BootstrapError> {
    let company = &config.documents.company_name;
    let builder = match &config.documents.template_dir {
        Some(dir) => TeraDocumentBuilder::from_dir(dir, company),
        None => TeraDocumentBuilder::embedded(company),
    }
    .map_err(BootstrapError::Templates)?;
    Ok(Arc::new(builder.with_wkhtmltopdf(config.documents.wkhtmltopdf_path.clone())))
}

fn delivery_channel(config: &AppConfig) -> Result<Arc<dyn DeliveryChannel>, BootstrapError> {
    if !config.whatsapp.enabled {
        return Ok(Arc::new(NoopDelivery));
    }
    let twilio = TwilioDelivery::from_config(&config.whatsapp).map_err(BootstrapError::Delivery)?;
    Ok(Arc::new(twilio))
}

fn email_sender(config: &AppConfig) -> Result<Arc<dyn EmailSender>, BootstrapError> {
    if !config.email.enabled {
        return Ok(Arc::new(DisabledEmailSender));
    }
    let resend = ResendEmailSender::from_config(&config.email).map_err(BootstrapError::Email)?;
    Ok(Arc::new(resend))
}

fn line_item_extractor(
    config: &AppConfig,
) -> Result<Arc<dyn LineItemExtraction>, BootstrapError> {
    if !config.llm.line_item_extraction {
        return Ok(Arc::new(DisabledExtractor));
    }
    let client = HttpLlmClient::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    Ok(Arc::new(LlmLineItemExtractor::new(Arc::new(client))))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use vocario_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn options(archive: &TempDir) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                archive_dir: Some(archive.path().to_path_buf()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_storage_with_migrations_applied() {
        let archive = TempDir::new().expect("temp dir");
        let app = bootstrap(options(&archive)).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name = 'conversation_session'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 1);
        assert!(app.sessions.health_check().await.is_ok());

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn enabled_whatsapp_without_credentials_fails_fast() {
        let archive = TempDir::new().expect("temp dir");
        let mut options = options(&archive);
        options.overrides.whatsapp_enabled = Some(true);

        let result = bootstrap(options).await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
