use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::domain::{PublishError, ValidationError};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Internal Server Error")]
    Publish(#[from] PublishError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::InvalidJson(_) | GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Publish(e) => {
                tracing::error!(error = %e, "publish failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
