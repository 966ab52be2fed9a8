use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
};
use serde::Serialize;

use crate::{AppResult, AppState, history::HistoryStore, models::ChatMessage};

#[derive(Debug, Serialize)]
pub(crate) struct Transcript {
    success: bool,
    data: Vec<ChatMessage>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_messages(
    Path(room_id): Path<String>,
    State(history): State<Arc<dyn HistoryStore>>,
) -> AppResult<Json<Transcript>> {
    let data = history.list(&room_id).await?;
    tracing::debug!(room = %room_id, count = data.len(), "listed transcript");

    Ok(Json(Transcript { success: true, data }))
}
