use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::protocol::zai::{AnonymousAuthResponse, UpstreamModel, UpstreamModelList, UpstreamRequest};
use crate::signature::{self, truncate_for_display};
use crate::token::{AnonymousTokenIssuer, AuthToken};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::Arc;
use std::time::Duration;

pub const X_FE_VERSION: &str = "prod-fe-1.0.94";
pub const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
pub const SEC_CH_UA: &str = r#""Chromium";v="140", "Not=A?Brand";v="24", "Google Chrome";v="140""#;
pub const SEC_CH_UA_MOBILE: &str = "?0";
pub const SEC_CH_UA_PLATFORM: &str = r#""Windows""#;
const PAGE_TITLE: &str = "Z.ai Chat - Free AI powered by GLM-4.6";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);
const AUTH_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
const MODELS_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_DISPLAY_LENGTH: usize = 20;

/// Characters left alone by form-style query escaping.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Form-style query escaping: unreserved characters pass through, spaces
/// become `+`, everything else is percent-encoded.
pub fn query_escape(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_ESCAPE)
        .to_string()
        .replace("%20", "+")
}

/// Client for streaming use: bounded connect, no overall deadline so long
/// generations are never cut off while bytes keep arriving.
///
/// reqwest has no separate TLS handshake bound; `connect_timeout` covers TCP and TLS together.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
}

/// Opaque request id in the `hex-hex-hex-hex-hex` shape the web client sends.
pub fn generate_request_id() -> String {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    format!(
        "{:x}-{:x}-{:x}-{:x}-{:x}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        now.timestamp(),
        now.nanosecond(),
        now.second(),
        now.minute()
    )
}

/// Browser fingerprint appended to every chat call.
#[derive(Debug, Clone)]
pub struct FingerprintQuery<'a> {
    pub timestamp_ms: i64,
    pub request_id: &'a str,
    pub user_id: &'a str,
    pub token: &'a str,
    pub chat_id: &'a str,
    pub origin_base: &'a str,
    pub host: &'a str,
    pub local_time: String,
    pub utc_time: String,
}

impl<'a> FingerprintQuery<'a> {
    pub fn now(
        timestamp_ms: i64,
        request_id: &'a str,
        user_id: &'a str,
        token: &'a str,
        chat_id: &'a str,
        config: &'a GatewayConfig,
    ) -> Self {
        Self {
            timestamp_ms,
            request_id,
            user_id,
            token,
            chat_id,
            origin_base: &config.origin_base,
            host: config.host(),
            local_time: chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            utc_time: chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S UTC")
                .to_string(),
        }
    }

    /// Parameter order is fixed; the upstream compares it against real browsers.
    pub fn render(&self) -> String {
        let ts = self.timestamp_ms;
        let chat_id = self.chat_id;
        let host = self.host;
        format!(
            "timestamp={ts}&requestId={request_id}&user_id={user_id}&version=0.0.1&platform=web&token={token}\
             &user_agent={ua}&language=zh-CN&languages=zh-CN,zh&timezone=Asia/Shanghai\
             &cookie_enabled=true&screen_width=1680&screen_height=1050&screen_resolution=1680x1050\
             &viewport_height=812&viewport_width=1087&viewport_size=1087x812\
             &color_depth=30&pixel_ratio=2\
             &current_url={current_url}&pathname=/c/{chat_id}&search=&hash=\
             &host={host}&hostname={host}&protocol=https:&referrer=\
             &title={title}\
             &timezone_offset=-480&local_time={local_time}&utc_time={utc_time}\
             &is_mobile=false&is_touch=false&max_touch_points=0\
             &browser_name=Chrome&os_name=Mac+OS&signature_timestamp={ts}",
            request_id = query_escape(self.request_id),
            user_id = query_escape(self.user_id),
            token = query_escape(self.token),
            ua = query_escape(BROWSER_UA),
            current_url = query_escape(&format!("{}/c/{}", self.origin_base, chat_id)),
            title = query_escape(PAGE_TITLE),
            local_time = query_escape(&self.local_time),
            utc_time = query_escape(&self.utc_time),
        )
    }
}

fn with_browser_identity(req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    req.header("User-Agent", BROWSER_UA)
        .header("sec-ch-ua", SEC_CH_UA)
        .header("sec-ch-ua-mobile", SEC_CH_UA_MOBILE)
        .header("sec-ch-ua-platform", SEC_CH_UA_PLATFORM)
        .header("X-FE-Version", X_FE_VERSION)
}

fn with_fetch_metadata(req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    req.header("Sec-Fetch-Dest", "empty")
        .header("Sec-Fetch-Mode", "cors")
        .header("Sec-Fetch-Site", "same-origin")
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, config: Arc<GatewayConfig>) -> Self {
        Self { http, config }
    }

    /// Sends one signed chat call. The response is returned as soon as its
    /// headers arrive; the body is left for the stream translator.
    pub async fn call(
        &self,
        request: &UpstreamRequest,
        chat_id: &str,
        token: &AuthToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let request_id = generate_request_id();
        let user_id = signature::extract_user_id(&token.value);
        let last_message = signature::last_user_message(&request.messages);
        let sig = signature::sign(
            last_message,
            &request_id,
            timestamp_ms,
            &user_id,
            self.config.signing_secret(),
        );
        tracing::debug!(
            user_id = %user_id,
            message = truncate_for_display(last_message, MESSAGE_DISPLAY_LENGTH),
            timestamp_ms,
            signature = %sig.value,
            "signed upstream request"
        );

        let query = FingerprintQuery::now(
            timestamp_ms,
            &request_id,
            &user_id,
            &token.value,
            chat_id,
            &self.config,
        )
        .render();
        let url = format!("{}?{}", self.config.upstream_url, query);
        let referer = format!("{}/c/{}", self.config.origin_base, chat_id);

        let req = self
            .http
            .post(&url)
            .json(request)
            .header("Accept", "*/*")
            .header("Accept-Language", "zh-CN")
            .bearer_auth(&token.value)
            .header("X-Signature", &sig.value)
            .header("Origin", &self.config.origin_base)
            .header("Referer", referer)
            .header("Connection", "keep-alive")
            .header("Cookie", format!("token={}", token.value));
        let req = with_fetch_metadata(with_browser_identity(req));

        let resp = match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "upstream request failed");
                return Err(GatewayError::UpstreamTransport(err.to_string()));
            }
            Err(_) => {
                tracing::warn!("upstream response headers timed out");
                return Err(GatewayError::UpstreamTransport(
                    "timed out waiting for upstream response headers".to_string(),
                ));
            }
        };

        let status = resp.status();
        tracing::debug!(status = status.as_u16(), origin = token.origin.as_str(), "upstream responded");
        if !status.is_success() {
            let body = if self.config.debug_mode {
                read_error_body(resp).await
            } else {
                String::new()
            };
            return Err(GatewayError::UpstreamStatus { status, body });
        }
        Ok(resp)
    }

    pub async fn fetch_anonymous_token(&self) -> Result<String, String> {
        let req = self
            .http
            .get(self.config.anonymous_auth_url())
            .timeout(AUTH_TOKEN_TIMEOUT)
            .header("Accept", "*/*")
            .header("Accept-Language", "zh-CN,zh;q=0.9")
            .header("Origin", &self.config.origin_base)
            .header("Referer", format!("{}/", self.config.origin_base));
        let resp = with_browser_identity(req)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(format!("anonymous token status={}", status.as_u16()));
        }
        let body: AnonymousAuthResponse = resp.json().await.map_err(|err| err.to_string())?;
        if body.token.is_empty() {
            return Err("anonymous token empty".to_string());
        }
        Ok(body.token)
    }

    pub async fn list_models(&self, token: &AuthToken) -> Result<Vec<UpstreamModel>, String> {
        let req = self
            .http
            .get(self.config.models_url())
            .timeout(MODELS_TIMEOUT)
            .header("Accept", "application/json")
            .header("Accept-Language", "zh-CN")
            .header("Content-Type", "application/json")
            .bearer_auth(&token.value)
            .header("Referer", format!("{}/", self.config.origin_base));
        let resp = with_fetch_metadata(with_browser_identity(req))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("models status={}", status.as_u16()));
        }
        let list: UpstreamModelList = resp.json().await.map_err(|err| err.to_string())?;
        Ok(list.data)
    }
}

/// Reads an error body for diagnostics only; a slow body is abandoned.
async fn read_error_body(resp: reqwest::Response) -> String {
    let status = resp.status().as_u16();
    match tokio::time::timeout(ERROR_BODY_TIMEOUT, resp.text()).await {
        Ok(Ok(body)) => {
            tracing::debug!(status, body = %body, "upstream error body");
            body
        }
        Ok(Err(err)) => {
            tracing::debug!(status, error = %err, "upstream error body unreadable");
            String::new()
        }
        Err(_) => {
            tracing::debug!(status, "upstream error body timed out");
            String::new()
        }
    }
}

#[async_trait]
impl AnonymousTokenIssuer for UpstreamClient {
    async fn issue(&self) -> Result<String, String> {
        self.fetch_anonymous_token().await
    }
}
