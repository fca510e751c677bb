pub mod auth;
pub mod chat;
pub mod chat_open;
pub mod stt;

use crate::AppState;
use axum::{routing::get, Router};
use std::sync::Arc;

async fn health_check() -> &'static str {
    "OK"
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/health-check", get(health_check))
        .merge(auth::router(app_state.clone()))
        .merge(chat::router(app_state.clone()))
        .merge(chat_open::router(app_state.clone()))
        .merge(stt::router(app_state))
}
