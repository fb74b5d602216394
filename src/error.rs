use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures detected before any byte of the response is flushed.
///
/// Protocol-level problems inside an already-flowing upstream stream
/// (unparseable lines, embedded error objects) never surface here; the
/// stream translator absorbs them and terminates the stream gracefully.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    ClientAuth(String),
    #[error("{0}")]
    RequestValidation(String),
    #[error("no upstream token available")]
    TokenUnavailable,
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: StatusCode, body: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientAuth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RequestValidation(_) => StatusCode::BAD_REQUEST,
            GatewayError::TokenUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamTransport(_) | GatewayError::UpstreamStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::ClientAuth(_) => "invalid_api_key",
            GatewayError::RequestValidation(_) => "invalid_request",
            GatewayError::TokenUnavailable => "no_token_available",
            GatewayError::UpstreamTransport(_) => "upstream_unreachable",
            GatewayError::UpstreamStatus { .. } => "upstream_error",
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let error_type = match err {
            GatewayError::ClientAuth(_) => "authentication_error",
            GatewayError::RequestValidation(_) => "invalid_request_error",
            _ => "api_error",
        };
        AppError::new(err.status(), err.code(), err.to_string()).with_type(error_type)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}
