//! Replica status.

use axum::{extract::State, routing::get, Json, Router};

use crate::error::HttpResult;
use crate::node::NodeStatus;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

/// GET /status - clock, counts, live sessions and sync cursors.
async fn status(State(state): State<AppState>) -> HttpResult<Json<NodeStatus>> {
    Ok(Json(state.node.status().await?))
}
