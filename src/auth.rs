use crate::error::GatewayError;
use crate::signature::truncate_for_display;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Checks callers against the single configured gateway key.
#[derive(Clone, Debug)]
pub struct AuthState {
    api_key: String,
}

impl AuthState {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| GatewayError::ClientAuth("missing authorization header".to_string()))?;
        let key = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or_else(|| GatewayError::ClientAuth("invalid authorization header".to_string()))?;
        if key != self.api_key {
            tracing::debug!(key = truncate_for_display(key, 10), "rejected api key");
            return Err(GatewayError::ClientAuth("invalid api key".to_string()));
        }
        Ok(())
    }
}
