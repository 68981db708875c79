use axum::{Json, http::StatusCode, response::IntoResponse};
use tracing::{error, warn};

use crate::{access_guard::Unauthorized, ingest::MalformedInput, storage::StoreError};

/// Error type for the REST API.
///
/// This error type is used to convert errors into HTTP responses.
/// The standard error response looks like this:
///
/// ```json
/// {
///     "ok": false,
///     "error": "ERROR_CODE",
///     "msg": "Error message"
/// }
/// ```
#[derive(Debug, thiserror::Error, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AppError {
    #[error(transparent)]
    MalformedInput(#[from] MalformedInput),

    #[error("bad key")]
    Unauthorized,

    // The store error is logged but never sent to the client.
    #[error("db error")]
    StoreUnavailable(#[source] StoreError),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::StoreUnavailable(_) | AppError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Converts errors into HTTP responses.
impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        // Error code is the enum variant name in SCREAMING_SNAKE_CASE.
        let error_code = self.as_ref();
        let message = self.to_string();
        let status_code = self.status_code();
        let json = serde_json::json!({ "ok": false, "error": error_code, "msg": message });

        match &self {
            AppError::StoreUnavailable(source) => {
                error!("Returning error {error_code}: {source}")
            }
            AppError::Internal => error!("Returning error {error_code}"),
            _ => warn!("Returning error {error_code}: {message}"),
        }
        (status_code, Json(json)).into_response()
    }
}

impl From<Unauthorized> for AppError {
    fn from(_: Unauthorized) -> Self {
        AppError::Unauthorized
    }
}

/// Converts storage errors into application errors.
impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        AppError::StoreUnavailable(error)
    }
}

/// Last-resort response for a handler that panicked.
pub fn handle_panic(_: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    AppError::Internal.into_response()
}
