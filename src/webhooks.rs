//! Inbound webhook routes (e.g. qBittorrent "download finished").
//!
//! Each configured hook gets its own `POST` route bound to a
//! `WebhookProcessor`, which formats the payload into the hook's template and
//! hands it to the shared notifier.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::channels::Notifier;
use crate::config::WebhookConfig;
use crate::error::{NotifyError, WebhookError};
use crate::pipeline::processor::format_template;

/// Used when a hook has no `telegram_message` configured.
pub const DEFAULT_DOWNLOAD_TEMPLATE: &str = "📥 **Download completed successfully!** 🎬\n\n🔍 **Name:**  \n%s\n\n📍 **Path:**  \n%s";

/// Reserved for the liveness probe.
pub const HEALTH_PATH: &str = "/health";

/// Body of an inbound webhook. Missing fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebhookPayload {
    #[serde(alias = "torrent_name")]
    pub name: String,
    #[serde(alias = "save_path")]
    pub path: String,
}

/// Formats a payload with the hook's template and notifies.
pub struct WebhookProcessor {
    name: String,
    chat_id: String,
    template: String,
    notifier: Arc<dyn Notifier>,
}

impl WebhookProcessor {
    pub fn new(hook: &WebhookConfig, notifier: Arc<dyn Notifier>) -> Self {
        let template = if hook.config.telegram_message.trim().is_empty() {
            DEFAULT_DOWNLOAD_TEMPLATE.to_string()
        } else {
            hook.config.telegram_message.clone()
        };

        Self {
            name: hook.name.clone(),
            chat_id: hook.config.telegram_chat_id.clone(),
            template,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, payload: &WebhookPayload) -> String {
        format_template(&self.template, &[&payload.name, &payload.path])
    }

    pub async fn process(&self, payload: &WebhookPayload) -> Result<(), NotifyError> {
        info!(hook = %self.name, name = %payload.name, "Processing webhook");
        self.notifier
            .notify(&self.chat_id, &self.render(payload))
            .await
    }
}

/// Build the router: one `POST` route per hook plus `GET /health`.
///
/// Hook paths must be unique and must not be `/health`; config validation
/// enforces both.
pub fn webhook_routes(hooks: &[WebhookConfig], notifier: Arc<dyn Notifier>) -> Router {
    let mut router = Router::new().route(HEALTH_PATH, get(health));

    for hook in hooks {
        let processor = Arc::new(WebhookProcessor::new(hook, Arc::clone(&notifier)));
        info!(hook = %hook.name, path = %hook.path, "Registered webhook route");
        router = router.route(&hook.path, post(handle_webhook).with_state(processor));
    }

    router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "automation-hub"
    }))
}

async fn handle_webhook(
    State(processor): State<Arc<WebhookProcessor>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let err = WebhookError::from(e);
            warn!(hook = %processor.name(), error = %err, "Rejected webhook request");
            return error_response(StatusCode::BAD_REQUEST, &err);
        }
    };

    match processor.process(&payload).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "success"}))),
        Err(e) => {
            let err = WebhookError::from(e);
            error!(hook = %processor.name(), error = %err, "Failed to process webhook");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

fn error_response(status: StatusCode, err: &WebhookError) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"status": "error", "error": err.to_string()})),
    )
}
