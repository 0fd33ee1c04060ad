//! Streaming chat relay
//!
//! [`RelayClient::relay`] posts a chat completion request with `stream: true`
//! to a running server and returns a [`RelayStream`]: a lazy sequence of
//! [`RelayEvent::Delta`]s ending in exactly one [`RelayEvent::Completed`] or
//! [`RelayEvent::Failed`]. No request is sent until the stream is first
//! polled, and dropping the stream closes the connection.

pub mod sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;
pub use crate::error::RelayFailure;
use crate::error::{MlxAdminError, Result};

use sse::{classify, decode_fragment, LineDecoder, SseLine};

/// A role-tagged chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Creates a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Creates a new user message
    ///
    /// # Examples
    ///
    /// ```
    /// use mlxadmin::relay::ChatMessage;
    ///
    /// let msg = ChatMessage::user("Hello");
    /// assert_eq!(msg.role, "user");
    /// assert_eq!(msg.content, "Hello");
    /// ```
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One item of a relayed completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Next piece of assistant text, in arrival order
    Delta(String),
    /// The stream ended; `text` is the concatenation of every delta
    Completed {
        /// Final accumulated message
        text: String,
    },
    /// The relay failed; `partial` holds the text received before that
    Failed {
        /// What went wrong
        failure: RelayFailure,
        /// Text accumulated up to the failure
        partial: String,
    },
}

/// Drained result of a [`RelayStream`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayOutcome {
    /// Accumulated text, partial if `failure` is set
    pub text: String,
    /// Terminal failure, if any
    pub failure: Option<RelayFailure>,
}

impl RelayOutcome {
    /// Final text, or the failure as an error
    pub fn into_result(self) -> Result<String> {
        match self.failure {
            None => Ok(self.text),
            Some(failure) => Err(MlxAdminError::Relay(failure).into()),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// HTTP client for streamed chat completions
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: Client,
}

impl RelayClient {
    /// Build a client with the configured request and connect timeouts
    ///
    /// The request timeout bounds the whole exchange, body included, so an
    /// unresponsive server cannot hang a reader forever.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .user_agent(concat!("mlxadmin/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MlxAdminError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Relay a chat turn to the server at `endpoint`
    ///
    /// `endpoint` is the server base URL, e.g. `http://localhost:9000`.
    /// `messages` is the full history; it is serialized immediately and not
    /// retained.
    pub fn relay(&self, endpoint: &str, model_ref: &str, messages: &[ChatMessage]) -> RelayStream {
        let url = format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'));
        tracing::debug!(url = %url, model = model_ref, messages = messages.len(), "relaying chat");

        let request = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&ChatCompletionRequest {
                model: model_ref,
                messages,
                stream: true,
            });

        let events = futures::stream::unfold(State::Pending(request), step);
        RelayStream {
            inner: Box::pin(events),
        }
    }
}

/// Lazy sequence of [`RelayEvent`]s for one chat turn
pub struct RelayStream {
    inner: Pin<Box<dyn Stream<Item = RelayEvent> + Send>>,
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream").finish_non_exhaustive()
    }
}

impl Stream for RelayStream {
    type Item = RelayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl RelayStream {
    /// Drain the stream, keeping partial text on failure
    pub async fn collect_outcome(mut self) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        while let Some(event) = self.next().await {
            match event {
                RelayEvent::Delta(_) => {}
                RelayEvent::Completed { text } => {
                    outcome.text = text;
                    break;
                }
                RelayEvent::Failed { failure, partial } => {
                    outcome.text = partial;
                    outcome.failure = Some(failure);
                    break;
                }
            }
        }
        outcome
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

enum State {
    Pending(reqwest::RequestBuilder),
    Streaming(Box<Streaming>),
    Finished,
}

struct Streaming {
    body: ByteStream,
    decoder: LineDecoder,
    lines: VecDeque<String>,
    text: String,
    fragments: usize,
    eof: bool,
}

async fn step(state: State) -> Option<(RelayEvent, State)> {
    match state {
        State::Finished => None,
        State::Pending(request) => match send(request).await {
            Ok(body) => next_event(Streaming {
                body,
                decoder: LineDecoder::new(),
                lines: VecDeque::new(),
                text: String::new(),
                fragments: 0,
                eof: false,
            })
            .await,
            Err(failure) => {
                tracing::warn!("chat relay failed: {}", failure);
                Some((
                    RelayEvent::Failed {
                        failure,
                        partial: String::new(),
                    },
                    State::Finished,
                ))
            }
        },
        State::Streaming(streaming) => next_event(*streaming).await,
    }
}

async fn send(request: reqwest::RequestBuilder) -> std::result::Result<ByteStream, RelayFailure> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            RelayFailure::Timeout
        } else {
            RelayFailure::Unreachable(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayFailure::ServerError {
            status: status.as_u16(),
            body,
        });
    }

    Ok(Box::pin(response.bytes_stream()))
}

async fn next_event(mut s: Streaming) -> Option<(RelayEvent, State)> {
    loop {
        while let Some(line) = s.lines.pop_front() {
            match classify(&line) {
                SseLine::Ignored => {}
                SseLine::Done => {
                    return Some((RelayEvent::Completed { text: s.text }, State::Finished));
                }
                SseLine::Data(payload) => match decode_fragment(payload) {
                    Ok(Some(delta)) => {
                        s.fragments += 1;
                        s.text.push_str(&delta);
                        return Some((RelayEvent::Delta(delta), State::Streaming(Box::new(s))));
                    }
                    Ok(None) => s.fragments += 1,
                    Err(e) => tracing::trace!("skipping undecodable fragment: {}", e),
                },
            }
        }

        // No sentinel before end of body still counts as a normal end.
        if s.eof {
            return Some((RelayEvent::Completed { text: s.text }, State::Finished));
        }

        match s.body.next().await {
            Some(Ok(chunk)) => {
                let lines = s.decoder.push(&chunk);
                s.lines.extend(lines);
            }
            Some(Err(e)) => {
                let failure = if e.is_timeout() {
                    RelayFailure::Timeout
                } else if s.fragments == 0 {
                    RelayFailure::Broken(e.to_string())
                } else {
                    tracing::warn!("stream ended abnormally after {} fragments: {}", s.fragments, e);
                    return Some((RelayEvent::Completed { text: s.text }, State::Finished));
                };
                tracing::warn!("chat relay failed: {}", failure);
                return Some((
                    RelayEvent::Failed {
                        failure,
                        partial: s.text,
                    },
                    State::Finished,
                ));
            }
            None => {
                s.eof = true;
                if let Some(line) = s.decoder.finish() {
                    s.lines.push_back(line);
                }
            }
        }
    }
}
