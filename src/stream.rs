use crate::config::ThinkTagsMode;
use crate::protocol::openai::{ChatCompletion, ChatCompletionChunk, ChunkChoice, CompletionChoice, Delta, Message, Usage};
use crate::protocol::zai::UpstreamSseEvent;
use crate::transforms::transform_thinking;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use tokio::sync::mpsc;

pub const DONE_SENTINEL: &str = "[DONE]";
const FINISH_REASON_STOP: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Started,
    Streaming,
    Finished,
    ErrorTerminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Finished | StreamState::ErrorTerminated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Explicit `done` flag or `phase == "done"`.
    Done,
    /// The upstream embedded an error object in an otherwise healthy stream.
    EmbeddedError { code: Option<Value>, detail: Option<String> },
    /// Body ended (or failed to read) without a done signal.
    EndOfBody,
    /// The caller went away; nothing more is written.
    ClientGone,
}

/// Splits a byte stream into `\n`-terminated lines, tolerating `\r\n` and
/// multi-byte characters split across chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Default, PartialEq)]
pub struct LineOutcome {
    pub content: Option<String>,
    pub terminal: Option<Termination>,
}

/// Per-request state machine over upstream SSE lines.
#[derive(Debug)]
pub struct StreamTranslator {
    mode: ThinkTagsMode,
    state: StreamState,
    lines_seen: usize,
}

impl StreamTranslator {
    pub fn new(mode: ThinkTagsMode) -> Self {
        Self {
            mode,
            state: StreamState::Started,
            lines_seen: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    pub fn begin(&mut self) {
        if self.state == StreamState::Started {
            self.state = StreamState::Streaming;
        }
    }

    pub fn feed_line(&mut self, line: &str) -> LineOutcome {
        if self.state.is_terminal() {
            return LineOutcome::default();
        }
        self.begin();
        self.lines_seen += 1;

        let Some(payload) = line.strip_prefix("data:") else {
            return LineOutcome::default();
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
        if payload.is_empty() {
            return LineOutcome::default();
        }
        if payload == DONE_SENTINEL {
            self.state = StreamState::Finished;
            return LineOutcome {
                content: None,
                terminal: Some(Termination::Done),
            };
        }

        let event: UpstreamSseEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(line = self.lines_seen, error = %err, "skipping unparseable upstream line");
                return LineOutcome::default();
            }
        };

        if let Some(err) = event.embedded_error() {
            tracing::warn!(
                code = ?err.code,
                detail = err.detail.as_deref().unwrap_or(""),
                "upstream embedded error, ending stream"
            );
            self.state = StreamState::ErrorTerminated;
            return LineOutcome {
                content: None,
                terminal: Some(Termination::EmbeddedError {
                    code: err.code.clone(),
                    detail: err.detail.clone(),
                }),
            };
        }

        tracing::trace!(
            kind = event.kind.as_deref().unwrap_or(""),
            phase = event.phase(),
            len = event.delta_content().len(),
            done = event.is_done(),
            "upstream event"
        );

        let content = self.accept_fragment(&event);
        let terminal = if event.is_done() {
            self.state = StreamState::Finished;
            Some(Termination::Done)
        } else {
            None
        };
        LineOutcome { content, terminal }
    }

    fn accept_fragment(&self, event: &UpstreamSseEvent) -> Option<String> {
        let delta = event.delta_content();
        if delta.is_empty() {
            return None;
        }
        let out = if event.phase() == "thinking" {
            transform_thinking(delta, self.mode)
        } else {
            delta.to_string()
        };
        (!out.is_empty()).then_some(out)
    }

    /// Marks the stream finished when the body ends without a done signal.
    pub fn end_of_body(&mut self) {
        if !self.state.is_terminal() {
            self.state = StreamState::Finished;
        }
    }
}

/// Builds the OpenAI chunks of one response, sharing id/created/model.
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl ChunkFactory {
    pub fn new(model: impl Into<String>) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{created}"),
            created,
            model: model.into(),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn role(&self) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some("assistant"),
                content: None,
            },
            None,
        )
    }

    pub fn content(&self, text: String) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: None,
                content: Some(text),
            },
            None,
        )
    }

    pub fn finish(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(FINISH_REASON_STOP))
    }

    pub fn completion(&self, content: String) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion",
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: Message::new("assistant", content),
                finish_reason: FINISH_REASON_STOP,
            }],
            usage: Usage::default(),
        }
    }
}

/// Pulls decoded lines out of an upstream body stream.
pub struct SseLines<S> {
    body: Pin<Box<S>>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    exhausted: bool,
}

impl<S, E> SseLines<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    pub fn new(body: S) -> Self {
        Self {
            body: Box::pin(body),
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.exhausted {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => self.pending.extend(self.decoder.push(&bytes)),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "upstream body read failed");
                    self.exhausted = true;
                    self.pending.extend(self.decoder.finish());
                }
                None => {
                    self.exhausted = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub termination: Termination,
    pub content_chunks: usize,
}

fn encode_chunk(chunk: &ChatCompletionChunk) -> String {
    serde_json::to_string(chunk).unwrap_or_default()
}

/// Translates the upstream body into SSE `data` payloads sent on `tx`: a role
/// chunk, one chunk per accepted fragment, then a finish chunk and `[DONE]`.
///
/// Returns early with [`Termination::ClientGone`] as soon as the receiver is
/// dropped, which releases the upstream body.
pub async fn forward_sse<S, E>(
    body: S,
    mut translator: StreamTranslator,
    chunks: &ChunkFactory,
    tx: &mpsc::Sender<String>,
) -> StreamSummary
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut summary = StreamSummary {
        termination: Termination::ClientGone,
        content_chunks: 0,
    };
    if tx.send(encode_chunk(&chunks.role())).await.is_err() {
        return summary;
    }
    translator.begin();

    let mut lines = SseLines::new(body);
    let termination = loop {
        let next = tokio::select! {
            line = lines.next_line() => line,
            _ = tx.closed() => {
                tracing::debug!("client disconnected, dropping upstream stream");
                return summary;
            }
        };
        let Some(line) = next else {
            translator.end_of_body();
            break Termination::EndOfBody;
        };
        let outcome = translator.feed_line(&line);
        if let Some(text) = outcome.content {
            if tx.send(encode_chunk(&chunks.content(text))).await.is_err() {
                tracing::debug!("client disconnected mid-stream");
                return summary;
            }
            summary.content_chunks += 1;
        }
        if let Some(terminal) = outcome.terminal {
            break terminal;
        }
    };

    tracing::debug!(
        lines = translator.lines_seen(),
        chunks = summary.content_chunks,
        termination = ?termination,
        "upstream stream finished"
    );
    if tx.send(encode_chunk(&chunks.finish())).await.is_ok() {
        let _ = tx.send(DONE_SENTINEL.to_string()).await;
    }
    summary.termination = termination;
    summary
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    pub content: String,
    pub termination: Termination,
}

/// Non-streaming counterpart of [`forward_sse`]: same per-line rules, with
/// every accepted fragment appended to one buffer.
pub async fn aggregate<S, E>(body: S, mut translator: StreamTranslator) -> Aggregated
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    translator.begin();
    let mut content = String::new();
    let mut lines = SseLines::new(body);
    let termination = loop {
        let Some(line) = lines.next_line().await else {
            translator.end_of_body();
            break Termination::EndOfBody;
        };
        let outcome = translator.feed_line(&line);
        if let Some(text) = outcome.content {
            content.push_str(&text);
        }
        if let Some(terminal) = outcome.terminal {
            break terminal;
        }
    };
    tracing::debug!(
        lines = translator.lines_seen(),
        len = content.len(),
        termination = ?termination,
        "aggregated upstream stream"
    );
    Aggregated {
        content,
        termination,
    }
}
