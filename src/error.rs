//! Service error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad or missing file, disallowed type, oversized payload, malformed fields.
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Incomplete upload: {received}/{total} chunks received")]
    IncompleteUpload { received: usize, total: usize },

    /// The OCR engine or the LLM call failed.
    #[error("{0}")]
    ExternalTool(String),

    /// A single-file extraction produced a failed record.
    #[error("{0}")]
    Extraction(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) | GatewayError::IncompleteUpload { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ExternalTool(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Extraction(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_upload_message_reports_counts() {
        let err = GatewayError::IncompleteUpload {
            received: 1,
            total: 3,
        };
        assert_eq!(err.to_string(), "Incomplete upload: 1/3 chunks received");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ExternalTool("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        let io = GatewayError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_error_body_is_structured() {
        let response = GatewayError::InvalidInput("No file provided".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "No file provided");
    }
}
