// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconnecting websocket sink.
//!
//! Events are sent as text frames. While the connection is down, events are
//! buffered up to a cap (oldest dropped first) and reconnection is attempted
//! with exponential backoff on subsequent writes.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::{Sink, SinkError};

/// Default cap on the disconnect buffer.
pub const DEFAULT_WS_BUFFER: usize = 256;

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sends streamed events to a websocket endpoint.
#[derive(Debug)]
pub struct WebSocketSink {
    name: String,
    url: String,
    conn: Option<WsStream>,
    buffer: VecDeque<Value>,
    cap: usize,
    dropped: u64,
    sent: u64,
    reconnect_attempt: u32,
    next_attempt_at: Option<Instant>,
}

impl WebSocketSink {
    /// Connect to `url`; the initial connection must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the endpoint cannot be reached.
    pub async fn connect(url: &str, cap: usize) -> Result<Self, SinkError> {
        let name = format!("websocket:{url}");
        let (conn, _) = connect_async(url)
            .await
            .map_err(|e| SinkError::new(&name, format!("connect {url}: {e}")))?;
        debug!(target: "kiwi.sink", %url, "websocket sink connected");
        Ok(Self {
            name,
            url: url.to_string(),
            conn: Some(conn),
            buffer: VecDeque::new(),
            cap: cap.max(1),
            dropped: 0,
            sent: 0,
            reconnect_attempt: 0,
            next_attempt_at: None,
        })
    }

    /// Events delivered to the endpoint.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Events dropped from the disconnect buffer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn backoff(&self) -> Duration {
        let exp = BASE_BACKOFF.saturating_mul(1u32 << self.reconnect_attempt.min(16));
        exp.min(MAX_BACKOFF)
    }

    async fn try_reconnect(&mut self) {
        if self.conn.is_some() {
            return;
        }
        if let Some(at) = self.next_attempt_at
            && Instant::now() < at
        {
            return;
        }
        match connect_async(self.url.as_str()).await {
            Ok((conn, _)) => {
                debug!(target: "kiwi.sink", url = %self.url, "websocket sink reconnected");
                self.conn = Some(conn);
                self.reconnect_attempt = 0;
                self.next_attempt_at = None;
            }
            Err(e) => {
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                self.next_attempt_at = Some(Instant::now() + self.backoff());
                warn!(
                    target: "kiwi.sink",
                    url = %self.url,
                    attempt = self.reconnect_attempt,
                    error = %e,
                    "websocket reconnect failed"
                );
            }
        }
    }

    /// Drain the buffer into the connection, detaching on send failure.
    async fn pump(&mut self) {
        while let Some(event) = self.buffer.front() {
            let Some(conn) = self.conn.as_mut() else { break };
            let payload = event.to_string();
            match conn.send(Message::text(payload)).await {
                Ok(()) => {
                    self.buffer.pop_front();
                    self.sent += 1;
                }
                Err(e) => {
                    warn!(target: "kiwi.sink", url = %self.url, error = %e, "websocket send failed; buffering");
                    self.conn = None;
                    self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                    self.next_attempt_at = Some(Instant::now() + self.backoff());
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, event: &Value) -> Result<(), SinkError> {
        self.buffer.push_back(event.clone());
        while self.buffer.len() > self.cap {
            self.buffer.pop_front();
            self.dropped += 1;
        }

        self.try_reconnect().await;
        self.pump().await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.try_reconnect().await;
        self.pump().await;

        let undelivered = self.buffer.len() as u64;
        if undelivered > 0 || self.dropped > 0 {
            warn!(
                target: "kiwi.sink",
                url = %self.url,
                undelivered,
                dropped = self.dropped,
                "websocket sink closed with unsent events"
            );
        }
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close(None).await;
        }
        Ok(())
    }
}
