use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(handlers::health_check))
        .route("/code-sessions", post(handlers::create_session))
        .route("/code-sessions/:id", patch(handlers::update_session))
        .route("/code-sessions/:id/run", post(handlers::run_session))
        .route("/executions/:id", get(handlers::get_execution))
}
