pub mod broker;
pub mod config;
pub mod db;
pub mod events;
pub mod forums;
pub mod history;
pub mod identity;
pub mod models;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::FromRef,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use broker::BrokerHandle;
use config::HeartbeatConfig;
use history::HistoryStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub history: Arc<dyn HistoryStore>,
    pub heartbeat: HeartbeatConfig,
}

/// Transcript routes under `/api/forums` and the chat socket at `/ws`.
pub fn app(app_state: AppState, cors_origins: &[HeaderValue]) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(cors_origins.to_vec())
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true);

    Router::new()
        .route("/ws", get(forums::forum_ws))
        .nest("/api/forums", forums::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": "Server error" })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
