// Errors surfaced over the HTTP boundary.
//
// Resolution and playback problems never show up here: the scheduler falls
// back to a placeholder and the controller records failures as state. Only
// per-request stream problems reach a viewer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No live session (or no file inside it) for the requested stream.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The content an encoder was asked to read does not exist.
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// The encoder process could not be launched or died during start-up.
    #[error("encoder failed to start: {0}")]
    EncoderStart(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StreamNotFound(_) => "stream_not_found",
            Self::InputNotFound(_) => "input_not_found",
            Self::EncoderStart(_) => "stream_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::StreamNotFound(_) | Self::InputNotFound(_) | Self::ChannelNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::EncoderStart(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
