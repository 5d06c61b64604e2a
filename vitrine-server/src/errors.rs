use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::warn;
use uuid::Uuid;
use vitrine_core::CoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
    pub correlation_id: Option<Uuid>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
            correlation_id: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            .with_correlation_id()
    }

    pub fn too_busy() -> Self {
        let mut err = Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "resize capacity exhausted, retry shortly",
        );
        err.retry_after_secs = Some(1);
        err
    }

    fn with_correlation_id(mut self) -> Self {
        self.correlation_id = Some(Uuid::new_v4());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        });
        if let Some(id) = self.correlation_id {
            body["error"]["correlation_id"] = json!(id.to_string());
        }

        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(msg) => Self::not_found(msg),
            CoreError::Validation(msg) => Self::bad_request(msg),
            CoreError::Conflict(msg) => Self::conflict(msg),
            CoreError::IllegalTransition { from, to } => Self::conflict(
                format!("illegal job transition: {from} -> {to}"),
            ),
            CoreError::PathTooLong(path) => {
                // The offending path goes to the log, not the response.
                let err = Self::internal("path exceeds the safe limit");
                warn!(
                    correlation_id = ?err.correlation_id,
                    path = %path.display(),
                    "path too long"
                );
                err
            }
            CoreError::TooBusy => Self::too_busy(),
            // Producer/codec trouble is an upstream failure: 502 lets the
            // client tell it apart from a server bug.
            CoreError::Codec(msg) => {
                Self::new(StatusCode::BAD_GATEWAY, msg)
            }
            CoreError::ArchiveCorrupt(msg)
            | CoreError::UnsupportedFormat(msg) => {
                Self::new(StatusCode::BAD_GATEWAY, msg)
            }
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        let cases = [
            (
                CoreError::NotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                CoreError::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (CoreError::TooBusy, StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::Codec("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn too_busy_carries_retry_after() {
        let err = AppError::from(CoreError::TooBusy);
        assert_eq!(err.retry_after_secs, Some(1));
    }

    #[test]
    fn internal_errors_get_a_correlation_id() {
        let err = AppError::from(CoreError::Internal("boom".into()));
        assert!(err.correlation_id.is_some());
    }
}
