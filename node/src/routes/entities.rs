//! Read-only entity lookup and history.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tandem_engine::{Entity, Operation};

use crate::error::{AppError, HttpResult};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities/{id}", get(get_entity))
        .route("/entities/{id}/history", get(get_history))
}

/// GET /entities/{id} - the entity's current state, tombstoned ones included.
async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HttpResult<Json<Entity>> {
    state
        .node
        .get_entity_including_deleted(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("entity {id}")))
}

/// GET /entities/{id}/history - every stored operation on the entity.
async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HttpResult<Json<Vec<Operation>>> {
    let history = state.node.entity_history(&id).await?;
    if history.is_empty() {
        return Err(AppError::NotFound(format!("history of {id}")));
    }
    Ok(Json(history))
}
