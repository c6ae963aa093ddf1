//! HTTP mapping for loop failures. Bodies are always `{"error": "<message>"}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use watchdog_core::{GatewayError, LoopError, StoreError};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<LoopError> for ApiError {
    fn from(err: LoopError) -> Self {
        let status = match &err {
            LoopError::SessionBusy(_) => StatusCode::CONFLICT,
            LoopError::Gateway(_) => StatusCode::BAD_GATEWAY,
            // Only reachable when a client vanished; nobody reads the body.
            LoopError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        LoopError::from(err).into()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        LoopError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(target: "watchdog::http", %status, error = %self.message, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}
