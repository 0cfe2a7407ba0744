use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use eyre::Report;

#[derive(Debug, thiserror::Error)]
pub enum AttestorServerError {
    #[error(transparent)]
    Unexpected(#[from] Report),
    #[error("Failed to accept client connection: {0}")]
    Connection(String),
    #[error("Invalid request from client: {0}")]
    BadClientRequest(String),
    #[error("Too many concurrent sessions")]
    Overloaded,
}

/// Trait implementation to convert this error into an axum http response
impl IntoResponse for AttestorServerError {
    fn into_response(self) -> Response {
        match self {
            bad_request_error @ AttestorServerError::BadClientRequest(_) => {
                (StatusCode::BAD_REQUEST, bad_request_error.to_string()).into_response()
            }
            overloaded @ AttestorServerError::Overloaded => {
                (StatusCode::SERVICE_UNAVAILABLE, overloaded.to_string()).into_response()
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something wrong happened.",
            )
                .into_response(),
        }
    }
}
