use crate::error::GatewayError;
use crate::signature::truncate_for_display;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN_DISPLAY_LENGTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    ExplicitHeader,
    ConfiguredEnv,
    PoolRandom,
    Anonymous,
}

impl TokenOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitHeader => "explicit-header",
            Self::ConfiguredEnv => "configured-env",
            Self::PoolRandom => "pool-random",
            Self::Anonymous => "anonymous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub origin: TokenOrigin,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, origin: TokenOrigin) -> Self {
        Self {
            value: value.into(),
            origin,
        }
    }

    pub fn display(&self) -> &str {
        truncate_for_display(&self.value, TOKEN_DISPLAY_LENGTH)
    }
}

/// External credential pool, typically filled by an account registration job.
#[async_trait]
pub trait TokenPool: Send + Sync {
    async fn random_token(&self) -> Result<Option<String>, String>;
}

/// Source of short-lived anonymous credentials.
#[async_trait]
pub trait AnonymousTokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<String, String>;
}

/// Reads tokens from the `accounts` table of the registration database.
///
/// The connection is opened lazily, so the database file may appear after
/// the gateway starts.
#[derive(Clone)]
pub struct SqliteTokenPool {
    pool: Pool<Sqlite>,
}

impl SqliteTokenPool {
    pub fn open(path: &str) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);
        Self { pool }
    }
}

#[async_trait]
impl TokenPool for SqliteTokenPool {
    async fn random_token(&self) -> Result<Option<String>, String> {
        sqlx::query_scalar::<_, String>(
            r#"SELECT token FROM accounts
               WHERE status = 'active' AND token IS NOT NULL AND token != ''
               ORDER BY RANDOM() LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())
    }
}

/// Picks the upstream credential for one request, first source present wins:
/// caller header, configured token, pool, anonymous issuance.
#[derive(Clone, Default)]
pub struct TokenResolver {
    static_token: Option<String>,
    pool: Option<Arc<dyn TokenPool>>,
    anonymous: Option<Arc<dyn AnonymousTokenIssuer>>,
}

impl TokenResolver {
    pub fn new(static_token: Option<String>) -> Self {
        Self {
            static_token: static_token.filter(|t| !t.is_empty()),
            pool: None,
            anonymous: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn TokenPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_anonymous(mut self, issuer: Arc<dyn AnonymousTokenIssuer>) -> Self {
        self.anonymous = Some(issuer);
        self
    }

    pub async fn resolve(&self, explicit: Option<&str>) -> Result<AuthToken, GatewayError> {
        if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
            let token = AuthToken::new(token, TokenOrigin::ExplicitHeader);
            tracing::debug!(token = token.display(), "using caller-supplied token");
            return Ok(token);
        }

        if let Some(token) = &self.static_token {
            let token = AuthToken::new(token.clone(), TokenOrigin::ConfiguredEnv);
            tracing::debug!(token = token.display(), "using configured token");
            return Ok(token);
        }

        if let Some(pool) = &self.pool {
            match pool.random_token().await {
                Ok(Some(token)) if !token.is_empty() => {
                    let token = AuthToken::new(token, TokenOrigin::PoolRandom);
                    tracing::debug!(token = token.display(), "using pooled token");
                    return Ok(token);
                }
                Ok(_) => tracing::debug!("token pool is empty"),
                Err(err) => tracing::warn!(error = %err, "token pool lookup failed"),
            }
        }

        if let Some(issuer) = &self.anonymous {
            match issuer.issue().await {
                Ok(token) if !token.is_empty() => {
                    let token = AuthToken::new(token, TokenOrigin::Anonymous);
                    tracing::debug!(token = token.display(), "using anonymous token");
                    return Ok(token);
                }
                Ok(_) => tracing::warn!("anonymous token response was empty"),
                Err(err) => tracing::warn!(error = %err, "anonymous token request failed"),
            }
        }

        Err(GatewayError::TokenUnavailable)
    }
}
