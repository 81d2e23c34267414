//! Client for the local Ollama inference server.
//!
//! One request maps to one `POST /api/chat` with the full message history and
//! `stream: true`; the reply arrives as newline-delimited JSON chunks that are
//! surfaced lazily through [`TokenStream`]. Nothing is retried or cached.

use std::time::Duration;

use axum::body::Bytes;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::io::StreamReader;

use crate::model::ChatMessage;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "deepseek-r1:1.5b";
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to reach the ollama server: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("ollama request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("ollama returned an error: {0}")]
    Backend(String),
    #[error("invalid response format from ollama: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Stable tag for the UI to key error styling off.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Backend(_) => "backend",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Generation parameters forwarded as the Ollama `options` object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: u32,
    pub repeat_penalty: f32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            num_predict: 512,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: &'a ModelOptions,
}

/// One newline-delimited chunk of a streaming chat response. Ollama reports
/// failures either as a non-2xx body or as an `error` field mid-stream.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct OllamaClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    options: ModelOptions,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self::with_timeout(base_url, model, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// The timeout bounds the whole exchange, reading the streamed body
    /// included.
    pub fn with_timeout(base_url: &str, model: &str, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            options: ModelOptions::default(),
        }
    }

    pub fn from_env() -> Self {
        let base_url =
            std::env::var(crate::env::OLLAMA_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model =
            std::env::var(crate::env::MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let timeout_ms = std::env::var(crate::env::INFER_TIMEOUT_MS).ok();
        let timeout_ms = timeout_ms.and_then(|x| x.parse::<u64>().ok());
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));

        Self::with_timeout(&base_url, &model, timeout)
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    /// Sends the whole history and returns the reply as a lazy sequence of
    /// text fragments. The payload is built fresh per call; identical
    /// histories always trigger a fresh request.
    pub async fn send(&self, history: &[ChatMessage]) -> Result<TokenStream, InferenceError> {
        let request = ChatRequest {
            model: &self.model,
            messages: history,
            stream: true,
            options: &self.options,
        };

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&request)
            .send()
            .await
            .map_err(classify)?;
        let response = error_for_status(response).await?;

        Ok(TokenStream::new(response))
    }

    /// Names of the models installed on the server, from `GET /api/tags`.
    pub async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .send()
            .await
            .map_err(classify)?;
        let response = error_for_status(response).await?;

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| InferenceError::Malformed(format!("unexpected /api/tags payload: {err}")))?;

        Ok(tags.models.into_iter().map(|tag| tag.name).collect())
    }

    /// Server reachability plus "is the configured model installed" check.
    pub async fn preflight(&self) -> Result<(), InferenceError> {
        let models = self.list_models().await?;
        if !models.iter().any(|name| name == &self.model) {
            return Err(InferenceError::Backend(format!(
                "model '{}' is not installed on the ollama server (try `ollama pull {}`)",
                self.model, self.model
            )));
        }
        Ok(())
    }
}

type NdjsonLines = Lines<BufReader<StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>>>;

/// Pull-based view over one streaming chat reply: finite, non-restartable,
/// produced as chunks arrive off the socket. A single non-streamed JSON
/// object parses through the same path as a one-line stream.
pub struct TokenStream {
    lines: NdjsonLines,
    done: bool,
}

impl TokenStream {
    fn new(response: reqwest::Response) -> Self {
        let bytes = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
            })
            .boxed();
        let lines = BufReader::new(StreamReader::new(bytes)).lines();

        Self { lines, done: false }
    }

    /// Next text fragment of the reply, or `None` once the reply is complete.
    /// After an error or completion the stream stays exhausted.
    pub async fn next_fragment(&mut self) -> Option<Result<String, InferenceError>> {
        loop {
            if self.done {
                return None;
            }

            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(classify_stream_error(err)));
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let chunk = match parse_chunk(line) {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            if let Some(message) = chunk.error {
                self.done = true;
                return Some(Err(InferenceError::Backend(message)));
            }
            if chunk.done {
                self.done = true;
            }

            match chunk.message {
                Some(message) if !message.content.is_empty() => {
                    return Some(Ok(message.content));
                }
                // The final chunk usually carries empty content.
                Some(_) if self.done => return None,
                Some(_) => continue,
                None if self.done => return None,
                None => {
                    self.done = true;
                    return Some(Err(InferenceError::Malformed(
                        "response chunk is missing message content".to_string(),
                    )));
                }
            }
        }
    }
}

fn parse_chunk(line: &str) -> Result<ChatChunk, InferenceError> {
    serde_json::from_str(line)
        .map_err(|err| InferenceError::Malformed(format!("undecodable response chunk: {err}")))
}

fn classify(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout(err)
    } else {
        InferenceError::Connection(err)
    }
}

/// Transport failures while reading the body arrive as `io::Error`s wrapping
/// the original `reqwest::Error`.
fn classify_stream_error(err: std::io::Error) -> InferenceError {
    let detail = err.to_string();
    match err
        .into_inner()
        .and_then(|inner| inner.downcast::<reqwest::Error>().ok())
    {
        Some(request_err) if request_err.is_timeout() => InferenceError::Timeout(*request_err),
        Some(request_err) => InferenceError::Connection(*request_err),
        None => InferenceError::Malformed(format!("response stream failed: {detail}")),
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|parsed| parsed.error)
        .unwrap_or(body);
    Err(InferenceError::Backend(format!("{status}: {detail}")))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{net::TcpListener, sync::Arc, time::Duration};

    use axum::{
        body::StreamBody,
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use futures::StreamExt;
    use serde_json::json;

    /// Canned behavior for the stub's `/api/chat` route.
    pub(crate) enum StubChat {
        Lines(Vec<String>),
        Status(u16, String),
        Delay(Duration, String),
        Trickle(Vec<String>, Duration),
    }

    pub(crate) fn chunk_line(content: &str, done: bool) -> String {
        json!({
            "model": "deepseek-r1:1.5b",
            "message": { "role": "assistant", "content": content },
            "done": done,
        })
        .to_string()
    }

    /// Serves a stub Ollama server on an ephemeral port, returning its base
    /// url.
    pub(crate) async fn spawn_stub(chat: StubChat, models: Vec<&str>) -> String {
        let chat = Arc::new(chat);
        let models: Vec<String> = models.into_iter().map(str::to_string).collect();

        let app = Router::new()
            .route(
                "/api/chat",
                post(move || {
                    let chat = chat.clone();
                    async move { respond(&chat).await }
                }),
            )
            .route(
                "/api/tags",
                get(move || async move {
                    let tags: Vec<_> = models.iter().map(|name| json!({ "name": name })).collect();
                    Json(json!({ "models": tags }))
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub listener");
        let addr = listener.local_addr().expect("stub listener has no addr");
        listener
            .set_nonblocking(true)
            .expect("failed to make stub listener nonblocking");
        tokio::spawn(
            axum::Server::from_tcp(listener)
                .expect("failed to start stub server")
                .serve(app.into_make_service()),
        );

        format!("http://{addr}")
    }

    async fn respond(chat: &StubChat) -> Response {
        match chat {
            StubChat::Lines(lines) => {
                let mut body = lines.join("\n");
                body.push('\n');
                (StatusCode::OK, body).into_response()
            }
            StubChat::Status(code, body) => (
                StatusCode::from_u16(*code).expect("stub status code"),
                body.clone(),
            )
                .into_response(),
            StubChat::Delay(delay, body) => {
                tokio::time::sleep(*delay).await;
                (StatusCode::OK, body.clone()).into_response()
            }
            StubChat::Trickle(lines, delay) => {
                let delay = *delay;
                let stream = futures::stream::iter(lines.clone()).then(move |mut line| async move {
                    tokio::time::sleep(delay).await;
                    line.push('\n');
                    Ok::<_, std::convert::Infallible>(line)
                });
                StreamBody::new(stream).into_response()
            }
        }
    }
}
