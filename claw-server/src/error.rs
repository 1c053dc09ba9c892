//! Maps [`claw_core::CoreError`] onto the HTTP status codes the REST
//! surface promises: 400 invalid input, 401 missing/invalid token, 404
//! no matching entry, 409 duplicate active email, 429 rate limited,
//! everything else 500 (and logged, since a 500 is always either a bug
//! or a storage problem worth knowing about).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use claw_core::CoreError;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::DuplicateEntry => StatusCode::CONFLICT,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::HardwareLocked => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::HardwareTimeout => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Store(_) | CoreError::Pool(_) | CoreError::Invariant(_) | CoreError::Config(_) | CoreError::Io(_) => {
                tracing::error!(error = %self.0, "internal error serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}
