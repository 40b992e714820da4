//! HTTP status API endpoint handlers.

use std::sync::Arc;

use axum::{Json, extract::State};
use serde::Serialize;

use crate::{domain::Identity, ui::state::AppState};

/// Response body of `GET /api/online`
#[derive(Debug, Serialize)]
pub struct OnlineUsersDto {
    pub count: usize,
    pub users: Vec<Identity>,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Identities currently connected, in join order
pub async fn online_users(State(state): State<Arc<AppState>>) -> Json<OnlineUsersDto> {
    let users = state.registry.snapshot().await;
    Json(OnlineUsersDto {
        count: users.len(),
        users,
    })
}
