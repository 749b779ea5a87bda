// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP client for the executor daemon.
//!
//! Control messages are plain JSON POSTs with per-call timeouts; the
//! task-event stream is SSE (`data: <json>\n\n` frames). Connection
//! establishment for the stream retries with linear backoff; once the
//! stream is up, any mid-stream failure is fatal and surfaced to the
//! caller, which marks the delegation `SSE_FAILED`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use awcp_config::DelegatorConfig;
use awcp_core::event::TaskEvent;
use awcp_core::message::ControlMessage;
use awcp_transport::OutboundChunk;

/// Failures talking to an executor daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection-level failure (refused, reset, timeout).
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The executor answered with a non-success status.
    #[error("executor returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The response body was not a valid control message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The event stream failed mid-task.
    #[error("event stream failed: {0}")]
    Sse(String),
}

fn awcp_url(base: &str) -> String {
    format!("{}/awcp", base.trim_end_matches('/'))
}

/// Client for one or more executor daemons.
pub struct ExecutorClient {
    http: reqwest::Client,
    control_timeout: Duration,
    handle_timeout: Duration,
    retry_attempts: u32,
    retry_base: Duration,
}

impl ExecutorClient {
    /// Build a client from the delegator configuration.
    #[must_use]
    pub fn new(config: &DelegatorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            control_timeout: Duration::from_secs(config.control_timeout_secs),
            handle_timeout: Duration::from_secs(config.handle_timeout_secs),
            retry_attempts: config.sse_retry_attempts,
            retry_base: Duration::from_millis(config.sse_retry_base_ms),
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(512);
        Err(ClientError::Status { status, body })
    }

    /// Send INVITE; the executor answers with ACCEPT or ERROR in the body.
    ///
    /// # Errors
    ///
    /// Connection failure, non-success status, or an unparseable reply.
    pub async fn send_invite(
        &self,
        base_url: &str,
        message: &ControlMessage,
    ) -> Result<ControlMessage, ClientError> {
        let response = self
            .http
            .post(awcp_url(base_url))
            .timeout(self.control_timeout)
            .json(message)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json::<ControlMessage>()
            .await
            .map_err(|e| ClientError::Protocol(format!("invalid INVITE reply: {e}")))
    }

    /// Send START. Uses the long handle timeout: inline archive handles
    /// can be large.
    ///
    /// # Errors
    ///
    /// Connection failure or a non-success status.
    pub async fn send_start(
        &self,
        base_url: &str,
        message: &ControlMessage,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(awcp_url(base_url))
            .timeout(self.handle_timeout)
            .json(message)
            .send()
            .await?;
        Self::check_status(response).await.map(|_| ())
    }

    /// Best-effort cancel; an executor that no longer knows the id (404)
    /// counts as success.
    ///
    /// # Errors
    ///
    /// Connection failure or a non-404 error status.
    pub async fn send_cancel(&self, base_url: &str, delegation_id: Uuid) -> Result<(), ClientError> {
        let url = format!("{}/cancel/{delegation_id}", awcp_url(base_url));
        let response = self
            .http
            .post(url)
            .timeout(self.control_timeout)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response).await.map(|_| ())
    }

    /// Acknowledge a terminal result so the executor may discard it.
    ///
    /// # Errors
    ///
    /// Connection failure or a non-success status.
    pub async fn send_ack(&self, base_url: &str, delegation_id: Uuid) -> Result<(), ClientError> {
        let url = format!("{}/tasks/{delegation_id}/ack", awcp_url(base_url));
        let response = self
            .http
            .post(url)
            .timeout(self.control_timeout)
            .send()
            .await?;
        Self::check_status(response).await.map(|_| ())
    }

    /// Upload the chunks of a chunked archive handle, then the completion
    /// call carrying the total checksum. Chunk uploads are idempotent on
    /// the executor side, so individual retries are safe.
    ///
    /// # Errors
    ///
    /// Connection failure or a non-success status on any upload.
    pub async fn upload_chunks(
        &self,
        base_url: &str,
        delegation_id: Uuid,
        chunks: &[OutboundChunk],
        total_sha256: &str,
    ) -> Result<(), ClientError> {
        for chunk in chunks {
            let url = format!("{}/chunks/{delegation_id}/{}", awcp_url(base_url), chunk.index);
            let response = self
                .http
                .post(url)
                .timeout(self.handle_timeout)
                .json(&json!({
                    "sha256": chunk.sha256,
                    "dataBase64": BASE64.encode(&chunk.bytes),
                }))
                .send()
                .await?;
            Self::check_status(response).await?;
        }

        let url = format!("{}/chunks/{delegation_id}/complete", awcp_url(base_url));
        let response = self
            .http
            .post(url)
            .timeout(self.control_timeout)
            .json(&json!({ "totalSha256": total_sha256 }))
            .send()
            .await?;
        Self::check_status(response).await.map(|_| ())
    }

    /// Open the task-event stream, retrying connection establishment up
    /// to the configured attempt count with linear backoff
    /// (`base × attempt`).
    ///
    /// # Errors
    ///
    /// The final connection error once every attempt has failed.
    pub async fn subscribe_events(
        &self,
        base_url: &str,
        delegation_id: Uuid,
    ) -> Result<EventStream, ClientError> {
        let url = format!("{}/tasks/{delegation_id}/events", awcp_url(base_url));
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=self.retry_attempts {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(delegation_id = %delegation_id, attempt, "event stream connected");
                    let bytes = response
                        .bytes_stream()
                        .map(|item| item.map(|b| b.to_vec()).map_err(|e| e.to_string()));
                    return Ok(EventStream::new(bytes));
                }
                Ok(response) => {
                    last_error = Some(ClientError::Status {
                        status: response.status().as_u16(),
                        body: String::new(),
                    });
                }
                Err(err) => last_error = Some(err.into()),
            }
            if attempt < self.retry_attempts {
                tokio::time::sleep(self.retry_base * attempt).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::Sse("no connection attempts were made".into())))
    }
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

/// Incremental parser over an SSE byte stream.
///
/// Yields parsed [`TaskEvent`]s; malformed `data:` lines are discarded.
/// Returns `None` at a clean end of stream — the caller decides whether
/// that end was legitimate (a terminal event was seen) or a failure.
pub struct EventStream {
    inner: ByteStream,
    buffer: Vec<u8>,
}

impl EventStream {
    /// Wrap a raw byte stream.
    pub fn new(inner: impl Stream<Item = Result<Vec<u8>, String>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
            buffer: Vec::new(),
        }
    }

    /// Next parsed event, `None` at end of stream, `Err` on a mid-stream
    /// transport failure.
    pub async fn next_event(&mut self) -> Option<Result<TaskEvent, ClientError>> {
        loop {
            while let Some(frame) = take_frame(&mut self.buffer) {
                if let Some(event) = parse_frame(&frame) {
                    return Some(Ok(event));
                }
            }
            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => return Some(Err(ClientError::Sse(err))),
                None => return None,
            }
        }
    }
}

/// Split one `\n\n`-terminated frame off the front of `buffer`.
fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let frame = buffer[..pos].to_vec();
    buffer.drain(..pos + 2);
    Some(frame)
}

/// Parse the `data:` lines of a frame into a [`TaskEvent`].
///
/// Malformed frames (bad UTF-8, bad JSON, comment-only frames) are
/// tolerated and yield `None`.
fn parse_frame(frame: &[u8]) -> Option<TaskEvent> {
    let text = std::str::from_utf8(frame).ok()?;
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        match serde_json::from_str::<TaskEvent>(data.trim_start()) {
            Ok(event) => return Some(event),
            Err(err) => {
                warn!(error = %err, "discarding malformed task event");
            }
        }
    }
    None
}
