use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

/// Process liveness. Backends are probed per adapter under `/api/v1/adapters/{adapter}/health`.
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "adapters": state.registry.len() }))
}
