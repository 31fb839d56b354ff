//! Transport seam of the bridge.
//!
//! A client channel is split into a receiving [`ChannelSource`] and a sending
//! [`ChannelSink`] so output can be pushed while input is being read.

use crate::protocol::{ChannelEvent, TransportError};
use async_trait::async_trait;

#[async_trait]
pub trait ChannelSource: Send {
    /// Wait for the next event.
    ///
    /// Must be cancel safe. Once the channel is gone this returns
    /// [`ChannelEvent::Disconnect`], and keeps doing so if polled again.
    async fn next_event(&mut self) -> ChannelEvent;
}

#[async_trait]
pub trait ChannelSink: Send + 'static {
    /// Send raw shell output as one message.
    async fn send_output(&mut self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Keep-alive probe, sent periodically while the session is idle.
    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the channel, telling the client why.
    async fn close(&mut self, reason: &str);

    /// False once either side has closed the channel.
    fn is_open(&self) -> bool;
}
