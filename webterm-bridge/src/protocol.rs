//! Message contract between the browser terminal and the bridge.
//!
//! Client → server messages are JSON text frames tagged by `type`. Server →
//! client output is raw shell bytes; the transport's own framing is the only
//! envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webterm_pty::TermSize;

/// Written to the terminal when the shell session ends.
pub const TERMINATION_NOTICE: &[u8] = b"\r\n\x1b[31mSession terminated.\x1b[0m\r\n";
/// Written to the terminal when no shell could be started.
pub const SPAWN_FAILURE_NOTICE: &[u8] = b"\r\n\x1b[31mFailed to start shell.\x1b[0m\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes or pasted text for the shell.
    Input { data: String },
    /// New terminal geometry, both dimensions > 0.
    Resize { rows: u16, cols: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid resize to {rows}x{cols}")]
    InvalidResize { rows: u16, cols: u16 },
    #[error("unsupported frame: {0}")]
    Unsupported(&'static str),
    #[error("channel closed")]
    Closed,
    #[error("socket error: {0}")]
    Socket(String),
}

impl TransportError {
    /// Fatal errors mean the channel can no longer be used and end the session.
    /// Everything else is noise on an otherwise healthy channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Socket(_))
    }
}

/// A normalized event from one client channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Input(Vec<u8>),
    Resize(TermSize),
    Error(TransportError),
    Disconnect(String),
}

impl ChannelEvent {
    /// Decode a JSON text frame. Undecodable frames become transient errors.
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message.into(),
            Err(e) => ChannelEvent::Error(TransportError::Malformed(e.to_string())),
        }
    }

    /// Binary frames carry raw input bytes.
    pub fn from_binary(data: impl Into<Vec<u8>>) -> Self {
        ChannelEvent::Input(data.into())
    }
}

impl From<ClientMessage> for ChannelEvent {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Input { data } => ChannelEvent::Input(data.into_bytes()),
            ClientMessage::Resize { rows, cols } => match TermSize::new(rows, cols) {
                Some(size) => ChannelEvent::Resize(size),
                None => ChannelEvent::Error(TransportError::InvalidResize { rows, cols }),
            },
        }
    }
}
