use crate::app::AppState;
use crate::config::CUSTOM_TOKEN_HEADER;
use crate::error::GatewayError;
use crate::protocol::openai::{ChatRequest, ModelEntry, ModelList};
use crate::protocol::zai::{ChatIds, UpstreamRequest};
use crate::stats::{CHAT_PATH, HOME_PATH, MODELS_PATH, Outcome, StatsCollector};
use crate::stream::{self, ChunkFactory, StreamTranslator};
use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SSE_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_PAGE_SIZE: usize = 20;

/// Per-request bookkeeping for the stats collaborator.
#[derive(Debug, Clone)]
struct RequestContext {
    method: &'static str,
    path: &'static str,
    started: Instant,
    user_agent: String,
}

impl RequestContext {
    fn new(method: &'static str, path: &'static str, headers: &HeaderMap) -> Self {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Self {
            method,
            path,
            started: Instant::now(),
            user_agent,
        }
    }

    fn report(&self, stats: &StatsCollector, status: StatusCode, model: &str, is_streaming: bool) {
        let duration = self.started.elapsed();
        stats.record_outcome(&Outcome {
            path: self.path,
            status: status.as_u16(),
            duration,
            model,
            is_streaming,
            tokens: 0,
        });
        stats.append_live_request(
            self.method,
            self.path,
            status.as_u16(),
            duration,
            &self.user_agent,
            model,
        );
    }
}

fn custom_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CUSTOM_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn home(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let ctx = RequestContext::new("GET", HOME_PATH, &headers);
    let body = json!({
        "status": "ok",
        "model": state.config.model_name,
        "endpoints": [MODELS_PATH, CHAT_PATH],
    });
    ctx.report(&state.stats, StatusCode::OK, "", false);
    Json(body)
}

/// Lists upstream models, degrading to the configured model on any failure.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Json<ModelList> {
    let ctx = RequestContext::new("GET", MODELS_PATH, &headers);
    let created = chrono::Utc::now().timestamp();
    let fallback = || vec![ModelEntry::new(state.config.model_name.clone(), created)];

    let data = match state.resolver.resolve(custom_token(&headers)).await {
        Ok(token) => match state.upstream.list_models(&token).await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "fetched upstream models");
                models
                    .iter()
                    .map(|m| ModelEntry::new(m.display_id(), created))
                    .collect()
            }
            Err(err) => {
                tracing::warn!(error = %err, "model list request failed, using fallback");
                fallback()
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "no token for model list, using fallback");
            fallback()
        }
    };

    ctx.report(&state.stats, StatusCode::OK, "", false);
    Json(ModelList {
        object: "list",
        data,
    })
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let ctx = RequestContext::new("POST", CHAT_PATH, &headers);
    match chat_completions(&state, &headers, body, &ctx).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(status = err.status().as_u16(), error = %err, "chat completion failed");
            ctx.report(&state.stats, err.status(), "", false);
            err.into_response()
        }
    }
}

async fn chat_completions(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
    ctx: &RequestContext,
) -> Result<Response, GatewayError> {
    state.auth.authenticate(headers)?;
    let body = body.map_err(|err| {
        GatewayError::RequestValidation(format!("failed to read request body: {}", err.body_text()))
    })?;

    let (req, stream) = parse_chat_request(&body, state.config.default_stream)?;
    let enable_thinking = req.enable_thinking.unwrap_or(state.config.enable_thinking);
    tracing::debug!(
        model = %req.model,
        stream,
        messages = req.messages.len(),
        enable_thinking,
        "chat request parsed"
    );

    let ids = ChatIds::generate();
    let upstream_req = UpstreamRequest::build(
        &state.config.model_name,
        req.messages,
        enable_thinking,
        &ids,
        chrono::Local::now(),
    );

    let token = state.resolver.resolve(custom_token(headers)).await?;
    let upstream_resp = state.upstream.call(&upstream_req, &ids.chat_id, &token).await?;

    let chunks = ChunkFactory::new(state.config.model_name.clone());
    let translator = StreamTranslator::new(state.config.think_tags_mode);
    let model = upstream_req.model;

    if !stream {
        let aggregated = stream::aggregate(upstream_resp.bytes_stream(), translator).await;
        ctx.report(&state.stats, StatusCode::OK, &model, false);
        return Ok(Json(chunks.completion(aggregated.content)).into_response());
    }

    let (tx, rx) = mpsc::channel::<String>(SSE_CHANNEL_CAPACITY);
    let stats = state.stats.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let summary = stream::forward_sse(upstream_resp.bytes_stream(), translator, &chunks, &tx).await;
        tracing::debug!(
            chat_id = %ids.chat_id,
            chunks = summary.content_chunks,
            termination = ?summary.termination,
            "stream closed"
        );
        ctx.report(&stats, StatusCode::OK, &model, true);
    });

    let events = ReceiverStream::new(rx).map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    let mut response = Sse::new(events).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// Decodes the caller body and decides the stream mode. An absent `stream`
/// key selects `default_stream`; an explicit value (including `false`) wins.
pub fn parse_chat_request(body: &[u8], default_stream: bool) -> Result<(ChatRequest, bool), GatewayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| GatewayError::RequestValidation(format!("invalid JSON: {err}")))?;
    let Some(obj) = value.as_object() else {
        return Err(GatewayError::RequestValidation(
            "request body must be a JSON object".to_string(),
        ));
    };
    let stream_present = obj.contains_key("stream");
    let req: ChatRequest = serde_json::from_value(value)
        .map_err(|err| GatewayError::RequestValidation(format!("invalid request: {err}")))?;
    let stream = if stream_present {
        req.stream.unwrap_or(false)
    } else {
        default_stream
    };
    Ok((req, stream))
}

pub async fn dashboard_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveRequestQuery {
    page: Option<String>,
    #[serde(rename = "pageSize")]
    page_size: Option<String>,
}

impl LiveRequestQuery {
    fn page(&self) -> usize {
        self.page
            .as_deref()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1)
    }

    fn page_size(&self) -> usize {
        self.page_size
            .as_deref()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| (1..=crate::stats::MAX_LIVE_REQUESTS).contains(n))
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

pub async fn dashboard_requests(
    State(state): State<AppState>,
    Query(query): Query<LiveRequestQuery>,
) -> impl IntoResponse {
    Json(state.stats.live_requests(query.page(), query.page_size()))
}
