mod messages;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use ws::forum_ws;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/messages", get(messages::list_messages))
}
