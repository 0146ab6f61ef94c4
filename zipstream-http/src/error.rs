use axum::response::{IntoResponse, Response};
use http::StatusCode;
use zipstream_core::ZipStreamError;

/// Errors that are answered with a status code, before any body is streamed.
#[derive(Debug)]
pub enum ApiError {
    Core(ZipStreamError),
    BadRequest(String),
}

impl From<ZipStreamError> for ApiError {
    fn from(e: ZipStreamError) -> Self {
        ApiError::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(
                e @ (ZipStreamError::NotFound { .. } | ZipStreamError::NoMatchingFiles { .. }),
            ) => {
                (StatusCode::NOT_FOUND, e.to_string()).into_response()
            }
            ApiError::Core(e @ ZipStreamError::Launch { .. }) => {
                tracing::error!(error = %e, "could not start archiver");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "The archive could not be generated",
                )
                    .into_response()
            }
            ApiError::Core(e) => {
                tracing::error!(error = %e, "archive request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        }
    }
}
