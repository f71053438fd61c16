use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use crate::core::client::prometheus::PromError;
use crate::core::store::StoreError;

/// Request-level error. Wraps the adapter errors so the response can tell
/// a relational-backend outage apart from a metrics-backend outage.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("ticket store query failed: {0}")]
    TicketStore(#[from] StoreError),

    #[error("metrics query failed: {0}")]
    Metrics(#[from] PromError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        // Choose status codes per variant
        let status = match &self {
            AppError::TicketStore(StoreError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TicketStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Metrics(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        // String provided by thiserror → safe JSON message
        let body = Json(json!({
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}
