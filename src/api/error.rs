use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::errors::{ProvisionError, RangeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorNumber {
    Internal = 1000,
    NotFound = 1001,
    Conflict = 1002,
    Hypervisor = 1003,
    Database = 1004,
    Capacity = 1005,
    RateLimited = 1006,
    PartialFailure = 1008,
}

#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub code: ErrorNumber,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: ErrorNumber, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorNumber::Internal, message)
    }
}

impl From<RangeError> for ErrorResponse {
    fn from(err: RangeError) -> Self {
        let (status, code) = match &err {
            RangeError::ContestNotFound(_)
            | RangeError::RecordNotFound { .. }
            | RangeError::VmNotFound(_) => (StatusCode::NOT_FOUND, ErrorNumber::NotFound),
            RangeError::RunInProgress { .. } => (StatusCode::CONFLICT, ErrorNumber::Conflict),
            RangeError::PairsFailed { .. } => {
                (StatusCode::MULTI_STATUS, ErrorNumber::PartialFailure)
            }
            RangeError::Hypervisor(_) | RangeError::Step { .. } => {
                (StatusCode::BAD_GATEWAY, ErrorNumber::Hypervisor)
            }
            RangeError::Provision(ProvisionError::NoCapacity { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorNumber::Capacity)
            }
            RangeError::Provision(_) => (StatusCode::BAD_GATEWAY, ErrorNumber::Hypervisor),
            RangeError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorNumber::Database),
        };
        if status.is_server_error() {
            error!(error = %err, "Request failed");
        }
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error_code": self.code as u32,
                "message": self.message
            })),
        )
            .into_response()
    }
}
