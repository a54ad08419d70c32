// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP client primitive.
//!
//! Sync mode issues one request under the tool's retry policy: network
//! errors and timeouts are inherently retryable, HTTP statuses only when
//! listed in `retry.retryable_errors`. Stream mode opens an SSE connection
//! and fans each `data:` payload out to the pre-instantiated sinks — the
//! primitive never constructs or closes sinks itself.

use std::time::Duration;

use futures::StreamExt;
use kiwi_core::RetrySpec;
use kiwi_error::ErrorCode;
use kiwi_sink::{Sink, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::{str_key, u64_key};

/// Default per-attempt timeout for sync requests.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Errors from the HTTP primitive.
#[derive(Debug, thiserror::Error)]
pub enum HttpPrimitiveError {
    /// The merged config is missing or mistypes a required key.
    #[error("http config invalid: {reason}")]
    Config {
        /// What is wrong with the config.
        reason: String,
    },

    /// The request failed after the retry policy was exhausted.
    #[error("http request failed ({kind}){}: {message}", .status.map(|s| format!(" status {s}")).unwrap_or_default())]
    Request {
        /// Failure kind: `network`, `timeout`, or `status`.
        kind: String,
        /// HTTP status, when a response arrived.
        status: Option<u16>,
        /// Underlying failure detail.
        message: String,
    },

    /// The SSE stream disconnected before a clean finish.
    #[error("stream ended early after {events_delivered} events: {message}")]
    StreamIncomplete {
        /// Events already fanned out to sinks.
        events_delivered: u64,
        /// Underlying failure detail.
        message: String,
    },

    /// A sink rejected an event.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The call was cancelled.
    #[error("http request cancelled")]
    Cancelled,
}

impl HttpPrimitiveError {
    /// Map to the stable [`ErrorCode`] taxonomy.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config { .. } | Self::Request { .. } => ErrorCode::HttpError,
            Self::StreamIncomplete { .. } => ErrorCode::StreamIncomplete,
            Self::Sink(_) => ErrorCode::SinkFailure,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Outcome of an HTTP primitive call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResult {
    /// `true` for a 2xx response (sync) or a cleanly finished stream.
    pub success: bool,
    /// HTTP status of the (final) response.
    pub status: Option<u16>,
    /// Response body (sync), or the return sink's buffer attached by the
    /// facade (stream).
    pub body: Option<Value>,
    /// Events fanned out in stream mode.
    pub stream_events_count: u64,
    /// Diagnostic names of the stream destinations.
    pub stream_destinations: Vec<String>,
    /// `false` when the stream disconnected mid-flight.
    pub clean_finish: bool,
    /// Advisory findings surfaced to the caller.
    pub warnings: Vec<String>,
}

impl HttpResult {
    fn sync(status: u16, body: Option<Value>) -> Self {
        Self {
            success: (200..300).contains(&status),
            status: Some(status),
            body,
            stream_events_count: 0,
            stream_destinations: Vec::new(),
            clean_finish: true,
            warnings: Vec::new(),
        }
    }
}

/// Stream-mode settings decoded from the merged config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Transport; only `sse` is driven by this primitive.
    #[serde(default = "StreamSpec::default_transport")]
    pub transport: String,
    /// Destination specs the facade turns into sinks.
    #[serde(default)]
    pub destinations: Vec<kiwi_sink::DestinationSpec>,
    /// Whether a `return` buffer should collect events.
    #[serde(default)]
    pub buffer_events: bool,
    /// Cap on the return buffer.
    #[serde(default = "StreamSpec::default_max_buffer")]
    pub max_buffer_size: usize,
}

impl StreamSpec {
    fn default_transport() -> String {
        "sse".into()
    }

    fn default_max_buffer() -> usize {
        kiwi_sink::DEFAULT_RETURN_BUFFER
    }

    /// Decode the `stream` section of a merged config, if present.
    ///
    /// # Errors
    ///
    /// Returns [`HttpPrimitiveError::Config`] when the section is malformed.
    pub fn from_config(config: &Map<String, Value>) -> Result<Option<Self>, HttpPrimitiveError> {
        match config.get("stream") {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| HttpPrimitiveError::Config {
                    reason: format!("stream: {e}"),
                }),
        }
    }
}

#[derive(Debug)]
struct HttpConfig {
    method: reqwest::Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    timeout: Duration,
    retry: Option<RetrySpec>,
}

impl HttpConfig {
    fn decode(config: &Map<String, Value>) -> Result<Self, HttpPrimitiveError> {
        let url = str_key(config, "url").ok_or_else(|| HttpPrimitiveError::Config {
            reason: "missing required key: url".into(),
        })?;
        let method = str_key(config, "method").unwrap_or_else(|| "GET".into());
        let method = method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|_| HttpPrimitiveError::Config {
                reason: format!("invalid method: {method}"),
            })?;

        let mut headers = Vec::new();
        if let Some(Value::Object(map)) = config.get("headers") {
            for (k, v) in map {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                headers.push((k.clone(), value));
            }
        }
        if let Some(Value::Object(auth)) = config.get("auth") {
            match auth.get("type").and_then(Value::as_str) {
                Some("bearer") => {
                    let token = auth.get("token").and_then(Value::as_str).ok_or_else(|| {
                        HttpPrimitiveError::Config {
                            reason: "auth.type bearer requires auth.token".into(),
                        }
                    })?;
                    headers.push(("authorization".into(), format!("Bearer {token}")));
                }
                Some("api_key") => {
                    let key = auth.get("key").and_then(Value::as_str).ok_or_else(|| {
                        HttpPrimitiveError::Config {
                            reason: "auth.type api_key requires auth.key".into(),
                        }
                    })?;
                    let header = auth
                        .get("header")
                        .and_then(Value::as_str)
                        .unwrap_or("x-api-key");
                    headers.push((header.to_string(), key.to_string()));
                }
                Some(other) => {
                    return Err(HttpPrimitiveError::Config {
                        reason: format!("unsupported auth type: {other}"),
                    });
                }
                None => {
                    return Err(HttpPrimitiveError::Config {
                        reason: "auth requires a type".into(),
                    });
                }
            }
        }

        let retry = match config.get("retry") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value::<RetrySpec>(v.clone()).map_err(|e| {
                HttpPrimitiveError::Config {
                    reason: format!("retry: {e}"),
                }
            })?),
        };

        Ok(Self {
            method,
            url,
            headers,
            body: config.get("body").cloned(),
            timeout: Duration::from_millis(u64_key(config, "timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS)),
            retry,
        })
    }

    fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }

    fn backoff(&self, failed_attempts: u32) -> Duration {
        let schedule = self.retry.as_ref().map(|r| r.backoff_ms.as_slice()).unwrap_or(&[]);
        match schedule {
            [] => {
                let exp = DEFAULT_BACKOFF_BASE.saturating_mul(1u32 << failed_attempts.min(16));
                exp.min(DEFAULT_BACKOFF_CAP)
            }
            ms => {
                let idx = (failed_attempts as usize).min(ms.len() - 1);
                Duration::from_millis(ms[idx])
            }
        }
    }

    fn status_retryable(&self, status: u16) -> bool {
        self.retry
            .as_ref()
            .is_some_and(|r| r.retryable_errors.iter().any(|e| e == &status.to_string()))
    }

    fn stream_retryable(&self) -> bool {
        self.retry
            .as_ref()
            .is_some_and(|r| r.retryable_errors.iter().any(|e| e == "STREAM_INCOMPLETE"))
    }
}

/// The built-in `http_client` primitive.
#[derive(Debug, Clone)]
pub struct HttpPrimitive {
    client: reqwest::Client,
}

impl Default for HttpPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPrimitive {
    /// Create the primitive with its own connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("build HTTP client"),
        }
    }

    fn request(&self, config: &HttpConfig, streaming: bool) -> reqwest::RequestBuilder {
        let mut req = self.client.request(config.method.clone(), &config.url);
        for (k, v) in &config.headers {
            req = req.header(k, v);
        }
        if streaming {
            req = req.header("accept", "text/event-stream");
        } else {
            req = req.timeout(config.timeout);
        }
        match &config.body {
            Some(Value::String(raw)) => req = req.body(raw.clone()),
            Some(json) => req = req.json(json),
            None => {}
        }
        req
    }

    /// Execute the merged config as a single (retried) request.
    ///
    /// # Errors
    ///
    /// Returns [`HttpPrimitiveError::Request`] with the last failure once the
    /// retry policy is exhausted.
    pub async fn execute(
        &self,
        config: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<HttpResult, HttpPrimitiveError> {
        let config = HttpConfig::decode(config)?;
        let max_attempts = config.max_attempts();
        let mut failed: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(HttpPrimitiveError::Cancelled);
            }

            let attempt_error = match self.request(&config, false).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        let body = decode_body(response).await;
                        return Ok(HttpResult::sync(status, body));
                    }
                    if config.status_retryable(status) {
                        HttpPrimitiveError::Request {
                            kind: "status".into(),
                            status: Some(status),
                            message: format!("retryable status {status}"),
                        }
                    } else {
                        let body = decode_body(response).await;
                        return Err(HttpPrimitiveError::Request {
                            kind: "status".into(),
                            status: Some(status),
                            message: body
                                .map(|b| b.to_string())
                                .unwrap_or_else(|| format!("status {status}")),
                        });
                    }
                }
                Err(e) if e.is_timeout() => HttpPrimitiveError::Request {
                    kind: "timeout".into(),
                    status: None,
                    message: e.to_string(),
                },
                Err(e) => HttpPrimitiveError::Request {
                    kind: "network".into(),
                    status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                },
            };

            failed += 1;
            if failed >= max_attempts {
                return Err(attempt_error);
            }
            let delay = config.backoff(failed - 1);
            debug!(
                target: "kiwi.exec.http",
                url = %config.url,
                attempt = failed,
                delay_ms = delay.as_millis() as u64,
                "retrying after failure"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(HttpPrimitiveError::Cancelled),
            }
        }
    }

    /// Execute the merged config as an SSE stream, fanning events out to
    /// `sinks` in order.
    ///
    /// The sinks arrive pre-instantiated and are closed by the caller after
    /// this returns — on success *and* on error.
    ///
    /// # Errors
    ///
    /// Returns [`HttpPrimitiveError::StreamIncomplete`] on mid-stream
    /// disconnect and [`HttpPrimitiveError::Sink`] when a sink write fails.
    pub async fn execute_stream(
        &self,
        config: &Map<String, Value>,
        sinks: &mut [Box<dyn Sink>],
        cancel: &CancelToken,
    ) -> Result<HttpResult, HttpPrimitiveError> {
        let config = HttpConfig::decode(config)?;
        let max_attempts = if config.stream_retryable() {
            config.max_attempts()
        } else {
            1
        };
        let mut failed: u32 = 0;

        loop {
            match self.stream_once(&config, sinks, cancel).await {
                Ok(result) => return Ok(result),
                // Only a stream that delivered nothing may retry: sinks have
                // already seen events otherwise, and replays would duplicate.
                Err(HttpPrimitiveError::StreamIncomplete {
                    events_delivered: 0,
                    message,
                }) if failed + 1 < max_attempts => {
                    failed += 1;
                    let delay = config.backoff(failed - 1);
                    warn!(target: "kiwi.exec.http", url = %config.url, attempt = failed, %message, "retrying stream");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(HttpPrimitiveError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(
        &self,
        config: &HttpConfig,
        sinks: &mut [Box<dyn Sink>],
        cancel: &CancelToken,
    ) -> Result<HttpResult, HttpPrimitiveError> {
        if cancel.is_cancelled() {
            return Err(HttpPrimitiveError::Cancelled);
        }

        let response = self.request(config, true).send().await.map_err(|e| {
            HttpPrimitiveError::StreamIncomplete {
                events_delivered: 0,
                message: e.to_string(),
            }
        })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(HttpPrimitiveError::Request {
                kind: "status".into(),
                status: Some(status),
                message: format!("stream request rejected with status {status}"),
            });
        }

        let destinations: Vec<String> = sinks.iter().map(|s| s.name().to_string()).collect();
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut delivered: u64 = 0;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                () = cancel.cancelled() => return Err(HttpPrimitiveError::Cancelled),
            };

            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(event) = next_sse_event(&mut buffer) {
                        if let Some(payload) = sse_data(&event) {
                            dispatch(sinks, &payload, &mut delivered).await?;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(target: "kiwi.exec.http", url = %config.url, delivered, error = %e, "stream disconnected");
                    return Err(HttpPrimitiveError::StreamIncomplete {
                        events_delivered: delivered,
                        message: e.to_string(),
                    });
                }
                None => break,
            }
        }

        // Trailing event without a final blank line still counts.
        if !buffer.is_empty()
            && let Ok(tail) = String::from_utf8(std::mem::take(&mut buffer))
            && let Some(payload) = sse_data(tail.as_bytes())
        {
            dispatch(sinks, &payload, &mut delivered).await?;
        }

        debug!(target: "kiwi.exec.http", url = %config.url, delivered, "stream finished cleanly");
        Ok(HttpResult {
            success: true,
            status: Some(status),
            body: None,
            stream_events_count: delivered,
            stream_destinations: destinations,
            clean_finish: true,
            warnings: Vec::new(),
        })
    }
}

async fn dispatch(
    sinks: &mut [Box<dyn Sink>],
    payload: &str,
    delivered: &mut u64,
) -> Result<(), HttpPrimitiveError> {
    let value: Value =
        serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    for sink in sinks.iter_mut() {
        sink.write(&value).await?;
    }
    *delivered += 1;
    Ok(())
}

async fn decode_body(response: reqwest::Response) -> Option<Value> {
    let text = response.text().await.ok()?;
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Pop the next complete SSE event (up to a blank line) off the buffer.
fn next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    let (pos, delim) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim);
    Some(event)
}

/// Join an event's `data:` lines; `None` when the event carries no data.
fn sse_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let mut data = String::new();
    let mut found = false;
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }
    found.then_some(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_sink::ReturnSink;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("config fixture must be an object"),
        }
    }

    // -- SSE parsing -----------------------------------------------------

    #[test]
    fn next_sse_event_splits_on_blank_lines() {
        let mut buf = b"data: one\n\ndata: two\n\npartial".to_vec();
        assert_eq!(next_sse_event(&mut buf).unwrap(), b"data: one");
        assert_eq!(next_sse_event(&mut buf).unwrap(), b"data: two");
        assert!(next_sse_event(&mut buf).is_none());
        assert_eq!(buf, b"partial");
    }

    #[test]
    fn next_sse_event_handles_crlf() {
        let mut buf = b"data: x\r\n\r\nrest".to_vec();
        assert_eq!(next_sse_event(&mut buf).unwrap(), b"data: x\r");
        assert_eq!(buf, b"rest");
    }

    #[test]
    fn sse_data_joins_multi_line_payloads() {
        assert_eq!(sse_data(b"data: a\ndata: b").unwrap(), "a\nb");
        assert_eq!(sse_data(b"data:tight").unwrap(), "tight");
        assert!(sse_data(b": comment\nevent: ping").is_none());
    }

    // -- sync mode -------------------------------------------------------

    #[tokio::test]
    async fn sync_get_decodes_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let primitive = HttpPrimitive::new();
        let result = primitive
            .execute(
                &config(json!({"url": format!("{}/status", server.uri())})),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.body, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn sync_post_sends_json_and_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
            .mount(&server)
            .await;

        let primitive = HttpPrimitive::new();
        let result = primitive
            .execute(
                &config(json!({
                    "method": "post",
                    "url": format!("{}/v1/messages", server.uri()),
                    "auth": {"type": "bearer", "token": "tok-123"},
                    "body": {"prompt": "hi"}
                })),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.body, Some(json!({"id": "m1"})));
    }

    #[tokio::test]
    async fn listed_status_retries_until_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute(
                &config(json!({
                    "url": format!("{}/flaky", server.uri()),
                    "retry": {"max_attempts": 3, "backoff_ms": [1, 1], "retryable_errors": ["503"]}
                })),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            HttpPrimitiveError::Request { status, .. } => assert_eq!(status, Some(503)),
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlisted_status_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nope"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute(
                &config(json!({
                    "url": format!("{}/nope", server.uri()),
                    "retry": {"max_attempts": 3, "backoff_ms": [1], "retryable_errors": ["503"]}
                })),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::HttpError);
    }

    #[tokio::test]
    async fn network_error_is_inherently_retryable() {
        // Nothing listens here; all attempts fail with a connect error.
        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute(
                &config(json!({
                    "url": "http://127.0.0.1:9/void",
                    "retry": {"max_attempts": 2, "backoff_ms": [1], "retryable_errors": []}
                })),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            HttpPrimitiveError::Request { kind, .. } => assert_eq!(kind, "network"),
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute(&config(json!({"method": "GET"})), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpPrimitiveError::Config { .. }));
    }

    // -- stream mode -----------------------------------------------------

    fn sse_body(events: usize) -> String {
        (0..events)
            .map(|i| format!("data: {{\"seq\": {i}}}\n\n"))
            .collect()
    }

    #[tokio::test]
    async fn stream_fans_out_to_every_sink_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(4)),
            )
            .mount(&server)
            .await;

        let first = ReturnSink::new(100);
        let second = ReturnSink::new(100);
        let first_handle = first.handle();
        let second_handle = second.handle();
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(first), Box::new(second)];

        let primitive = HttpPrimitive::new();
        let result = primitive
            .execute_stream(
                &config(json!({"method": "POST", "url": format!("{}/stream", server.uri())})),
                &mut sinks,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(result.clean_finish);
        assert_eq!(result.stream_events_count, 4);
        assert_eq!(result.stream_destinations, vec!["return", "return"]);
        for handle in [first_handle, second_handle] {
            let events = handle.events();
            assert_eq!(events.len(), 4);
            assert_eq!(events[0]["seq"], json!(0));
            assert_eq!(events[3]["seq"], json!(3));
        }
    }

    #[tokio::test]
    async fn stream_counts_trailing_event_without_blank_line() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"a\": 1}\n\ndata: {\"b\": 2}"),
            )
            .mount(&server)
            .await;

        let sink = ReturnSink::new(10);
        let handle = sink.handle();
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(sink)];

        let primitive = HttpPrimitive::new();
        let result = primitive
            .execute_stream(
                &config(json!({"url": format!("{}/stream", server.uri())})),
                &mut sinks,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.stream_events_count, 2);
        assert_eq!(handle.len(), 2);
    }

    #[tokio::test]
    async fn rejected_stream_request_is_a_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(ReturnSink::new(10))];
        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute_stream(
                &config(json!({"url": format!("{}/stream", server.uri())})),
                &mut sinks,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpPrimitiveError::Request { status: Some(401), .. }
        ));
    }

    #[tokio::test]
    async fn mid_stream_disconnect_reports_delivered_count() {
        // Hand-rolled server: advertises a long body, sends two events, then
        // drops the connection.
        use tokio::io::AsyncWriteExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let payload = "data: {\"seq\": 0}\n\ndata: {\"seq\": 1}\n\n";
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: 4096\r\n\r\n{payload}"
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.flush().await;
            // Drop without sending the promised remainder.
        });

        let sink = ReturnSink::new(10);
        let handle = sink.handle();
        let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(sink)];

        let primitive = HttpPrimitive::new();
        let err = primitive
            .execute_stream(
                &config(json!({"url": format!("http://{addr}/stream")})),
                &mut sinks,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            HttpPrimitiveError::StreamIncomplete { events_delivered, .. } => {
                assert_eq!(events_delivered, 2);
                assert_eq!(handle.len(), 2);
            }
            other => panic!("expected StreamIncomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_spec_decodes_from_config() {
        let cfg = config(json!({
            "stream": {
                "destinations": [{"type": "return"}, {"type": "file", "path": "t.jsonl"}],
                "buffer_events": true,
                "max_buffer_size": 64
            }
        }));
        let spec = StreamSpec::from_config(&cfg).unwrap().unwrap();
        assert_eq!(spec.transport, "sse");
        assert_eq!(spec.destinations.len(), 2);
        assert_eq!(spec.max_buffer_size, 64);
        assert!(StreamSpec::from_config(&config(json!({}))).unwrap().is_none());
    }
}
