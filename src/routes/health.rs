use axum::{extract::State, http::StatusCode, response::Json};
use diesel::connection::SimpleConnection;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Reports 503 when the database cannot be reached.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = match state.db() {
        Ok(mut conn) => conn.batch_execute("SELECT 1").is_ok(),
        Err(err) => {
            warn!(error = %err.message(), "health check could not reach the database");
            false
        }
    };

    if database_ok {
        (StatusCode::OK, Json(json!({ "status": "ok", "database": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unavailable" })),
        )
    }
}
