//! HTTP route definitions.

mod entities;
mod health;
mod status;

use axum::Router;

use crate::AppState;

/// Create all application routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(status::routes())
        .merge(entities::routes())
        .with_state(state)
}
