//! WebSocket transport for the bridge.
//!
//! Text frames carry JSON control messages, binary frames carry raw input in
//! and raw shell output out. The socket is split so output can be written
//! while the bridge waits for the next client frame.

use crate::server::AppState;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use webterm_bridge::{ChannelEvent, ChannelSink, ChannelSource, ConnectionId, TransportError};

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// A client silent for this long is treated as gone.
    pub idle_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_message_bytes: 100 * 1024 * 1024,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.gateway.max_message_bytes)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: AppState) {
    let (source, sink) = split(socket, &state.gateway);
    state.bridge.run(ConnectionId::new(), source, sink).await;
}

/// Split an upgraded socket into the bridge's two halves. Both share one
/// open flag so either side noticing the close stops further sends.
pub fn split(socket: WebSocket, config: &GatewayConfig) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    let open = Arc::new(AtomicBool::new(true));
    (
        WsSource {
            stream,
            open: Arc::clone(&open),
            idle_timeout: config.idle_timeout,
            last_seen: Instant::now(),
            gone: None,
        },
        WsSink { sink, open },
    )
}

pub struct WsSource {
    stream: SplitStream<WebSocket>,
    open: Arc<AtomicBool>,
    idle_timeout: Duration,
    last_seen: Instant,
    gone: Option<String>,
}

impl WsSource {
    fn hang_up(&mut self, reason: impl Into<String>) {
        self.open.store(false, Ordering::SeqCst);
        self.gone = Some(reason.into());
    }
}

#[async_trait]
impl ChannelSource for WsSource {
    async fn next_event(&mut self) -> ChannelEvent {
        loop {
            if let Some(reason) = &self.gone {
                return ChannelEvent::Disconnect(reason.clone());
            }

            let deadline = self.last_seen + self.idle_timeout;
            let message = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => {
                    debug!(idle = ?self.idle_timeout, "Client went silent");
                    self.hang_up("heartbeat timeout");
                    continue;
                }
                Ok(None) => {
                    self.hang_up("connection closed");
                    continue;
                }
                Ok(Some(Err(e))) => {
                    let reason = e.to_string();
                    self.hang_up(reason.clone());
                    return ChannelEvent::Error(TransportError::Socket(reason));
                }
                Ok(Some(Ok(message))) => message,
            };

            self.last_seen = Instant::now();
            if let Some(event) = event_from_message(message) {
                if let ChannelEvent::Disconnect(reason) = &event {
                    self.hang_up(reason.clone());
                }
                return event;
            }
        }
    }
}

/// Map one WebSocket frame to a bridge event. Keep-alive frames map to
/// nothing.
pub fn event_from_message(message: Message) -> Option<ChannelEvent> {
    match message {
        Message::Text(text) => Some(ChannelEvent::from_text(text.as_str())),
        Message::Binary(data) => Some(ChannelEvent::from_binary(data.to_vec())),
        Message::Close(frame) => {
            let reason = frame
                .map(|frame| frame.reason.to_string())
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "client closed".to_string());
            Some(ChannelEvent::Disconnect(reason))
        }
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
    open: Arc<AtomicBool>,
}

impl WsSink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.sink.send(message).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            TransportError::Socket(e.to_string())
        })
    }
}

#[async_trait]
impl ChannelSink for WsSink {
    async fn send_output(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Binary(Bytes::from(data))).await
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        self.send(Message::Ping(Bytes::new())).await
    }

    async fn close(&mut self, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: truncate(reason, MAX_CLOSE_REASON).into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Failed to send close frame");
        }
        let _ = self.sink.close().await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
