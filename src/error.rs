//! Error taxonomy for registry operations and their JSON rendering

use crate::storage::StorageError;
use crate::supervisor::{SupervisorAction, SupervisorError};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by registry operations.
///
/// None of these are fatal to the process; the API maps each to a status code.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("invalid service name: {0}")]
    InvalidName(String),

    /// Disk write, rename or read failed. Nothing was changed in memory
    /// and no supervisor action was issued.
    #[error("failed to persist service '{name}': {source}")]
    PersistenceFailure {
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("{action} of service '{name}' failed: {source}")]
    SupervisorFailure {
        name: String,
        action: SupervisorAction,
        #[source]
        source: SupervisorError,
    },

    /// The supervisor gave no clear answer; the cached state was left alone
    /// and the caller should re-query.
    #[error("{action} of service '{name}' has unknown outcome: {source}")]
    SupervisorIndeterminate {
        name: String,
        action: SupervisorAction,
        #[source]
        source: SupervisorError,
    },
}

impl ServiceError {
    pub fn from_storage(name: &str, err: StorageError) -> Self {
        match err {
            StorageError::InvalidName(reason) => ServiceError::InvalidName(reason),
            source => ServiceError::PersistenceFailure {
                name: name.to_string(),
                source,
            },
        }
    }

    pub fn from_supervisor(name: &str, action: SupervisorAction, err: SupervisorError) -> Self {
        if err.is_indeterminate() {
            ServiceError::SupervisorIndeterminate {
                name: name.to_string(),
                action,
                source: err,
            }
        } else {
            ServiceError::SupervisorFailure {
                name: name.to_string(),
                action,
                source: err,
            }
        }
    }

    pub fn code(&self) -> ApiErrorCode {
        match self {
            ServiceError::NotFound(_) => ApiErrorCode::NotFound,
            ServiceError::InvalidName(_) => ApiErrorCode::InvalidName,
            ServiceError::PersistenceFailure { .. } => ApiErrorCode::PersistenceFailure,
            ServiceError::SupervisorFailure { .. } => ApiErrorCode::SupervisorFailure,
            ServiceError::SupervisorIndeterminate { .. } => ApiErrorCode::SupervisorIndeterminate,
        }
    }
}

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Unknown service or route
    NotFound,
    /// Service name failed validation
    InvalidName,
    /// Request body could not be parsed
    BadRequest,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Artifacts could not be written or read
    PersistenceFailure,
    /// Supervisor reported failure
    SupervisorFailure,
    /// Supervisor action timed out or could not be run
    SupervisorIndeterminate,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InvalidName => StatusCode::BAD_REQUEST,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::SupervisorFailure => StatusCode::BAD_GATEWAY,
            ApiErrorCode::SupervisorIndeterminate => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Value for the X-Portcullis-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::InvalidName => "INVALID_NAME",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ApiErrorCode::SupervisorFailure => "SUPERVISOR_FAILURE",
            ApiErrorCode::SupervisorIndeterminate => "SUPERVISOR_INDETERMINATE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Portcullis-Error header
pub fn json_error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("X-Portcullis-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

impl ServiceError {
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        json_error_response(self.code(), self.to_string())
    }
}
