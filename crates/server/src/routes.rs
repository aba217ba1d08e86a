use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::warn;
use uuid::Uuid;
use vocario_core::{ApplicationError, DocumentFormat, DocumentRecord, InterfaceError};
use vocario_db::SessionStore;
use vocario_whatsapp::{IngressError, TwilioWebhook, WebhookIngress};

use crate::builder::DocumentBuilder;
use crate::health;

const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<WebhookIngress>,
    pub builder: Arc<dyn DocumentBuilder>,
}

/// `/webhook/whatsapp`, `/api/documents/{format}`, `/health` and the archive under `/documents`.
pub fn router(state: AppState, sessions: Arc<dyn SessionStore>, archive_dir: &Path) -> Router {
    Router::new()
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .route("/api/documents/{format}", post(render_document))
        .with_state(state)
        .merge(health::router(sessions))
        .nest_service("/documents", ServeDir::new(archive_dir))
}

/// Replies go out through the delivery channel, so Twilio gets an empty TwiML answer. Handler
/// failures answer 500 so Twilio redelivers the message.
async fn whatsapp_webhook(
    State(state): State<AppState>,
    Form(payload): Form<TwilioWebhook>,
) -> Response {
    match state.ingress.receive(&payload, Utc::now()).await {
        Ok(_) => ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response(),
        Err(IngressError::Webhook(error)) => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        Err(IngressError::Handler(_)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn render_document(
    State(state): State<AppState>,
    UrlPath(format): UrlPath<String>,
    Json(document): Json<DocumentRecord>,
) -> Response {
    let Ok(format) = format.parse::<DocumentFormat>() else {
        return (StatusCode::NOT_FOUND, format!("unknown document format `{format}`"))
            .into_response();
    };

    match state.builder.build(&document, format).await {
        Ok(bytes) => {
            let disposition = format!("attachment; filename=\"{}\"", document.filename(format));
            (
                [
                    (header::CONTENT_TYPE, format.content_type().to_owned()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
        Err(error) => {
            let correlation_id = Uuid::new_v4().to_string();
            warn!(
                event_name = "documents.render.failed",
                correlation_id = %correlation_id,
                number = %document.number,
                error = %error,
                "document render request failed"
            );
            ApiError(ApplicationError::from(error).into_interface(correlation_id)).into_response()
        }
    }
}

struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.user_message(),
            "correlation_id": self.0.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}
