pub mod email;
pub mod health;
pub mod logs;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(email::router())
        .merge(logs::router())
        .with_state(state)
}
