#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webterm_bridge::{
    Bridge, BridgeConfig, ChannelEvent, ChannelSink, ChannelSource, ClientMessage,
    SessionRegistry, TransportError,
};
use webterm_pty::SpawnConfig;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the bridge pushed at the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFrame {
    Output(Vec<u8>),
    Ping,
    Close(String),
}

pub struct FakeSource {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelSource for FakeSource {
    async fn next_event(&mut self) -> ChannelEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => {
                self.open.store(false, Ordering::SeqCst);
                ChannelEvent::Disconnect("client hung up".into())
            }
        }
    }
}

pub struct FakeSink {
    frames: mpsc::UnboundedSender<SinkFrame>,
    open: Arc<AtomicBool>,
    /// Output never completes, like a client that stopped reading.
    stalled: bool,
}

#[async_trait]
impl ChannelSink for FakeSink {
    async fn send_output(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.frames
            .send(SinkFrame::Output(data))
            .map_err(|_| TransportError::Closed)
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        self.frames
            .send(SinkFrame::Ping)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.frames.send(SinkFrame::Close(reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// The browser end of an in-memory channel.
pub struct FakeClient {
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    frames: mpsc::UnboundedReceiver<SinkFrame>,
    pub output: Vec<u8>,
    pub pings: usize,
    pub closed: Option<String>,
}

pub fn channel() -> (FakeSource, FakeSink, FakeClient) {
    new_channel(false)
}

/// A channel whose client accepts no output at all.
pub fn stalled_channel() -> (FakeSource, FakeSink, FakeClient) {
    new_channel(true)
}

fn new_channel(stalled: bool) -> (FakeSource, FakeSink, FakeClient) {
    let open = Arc::new(AtomicBool::new(true));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    (
        FakeSource {
            events: events_rx,
            open: Arc::clone(&open),
        },
        FakeSink {
            frames: frames_tx,
            open,
            stalled,
        },
        FakeClient {
            events: Some(events_tx),
            frames: frames_rx,
            output: Vec::new(),
            pings: 0,
            closed: None,
        },
    )
}

impl FakeClient {
    pub fn send(&self, event: ChannelEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn input(&self, data: &str) {
        self.send(ClientMessage::Input { data: data.into() }.into());
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        self.send(ClientMessage::Resize { rows, cols }.into());
    }

    pub fn error(&self, error: TransportError) {
        self.send(ChannelEvent::Error(error));
    }

    pub fn disconnect(&self) {
        self.send(ChannelEvent::Disconnect("client closed".into()));
    }

    /// Drop the sending half, as if the socket vanished.
    pub fn hang_up(&mut self) {
        self.events = None;
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    fn record(&mut self, frame: SinkFrame) {
        match frame {
            SinkFrame::Output(data) => self.output.extend_from_slice(&data),
            SinkFrame::Ping => self.pings += 1,
            SinkFrame::Close(reason) => self.closed = Some(reason),
        }
    }

    /// Collect frames until the output contains `needle`, the channel closes,
    /// or the timeout expires. Returns all output seen so far.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let _ = tokio::time::timeout(TEST_TIMEOUT, async {
            while !self.output_text().contains(needle) && self.closed.is_none() {
                match self.frames.recv().await {
                    Some(frame) => self.record(frame),
                    None => break,
                }
            }
        })
        .await;
        self.output_text()
    }

    /// Collect frames until the bridge closes the channel. Returns the close
    /// reason.
    pub async fn wait_closed(&mut self) -> Option<String> {
        let _ = tokio::time::timeout(TEST_TIMEOUT, async {
            while self.closed.is_none() {
                match self.frames.recv().await {
                    Some(frame) => self.record(frame),
                    None => break,
                }
            }
        })
        .await;
        self.closed.clone()
    }

    /// Collect whatever frames arrive during `period`.
    pub async fn collect_for(&mut self, period: Duration) {
        let _ = tokio::time::timeout(period, async {
            while let Some(frame) = self.frames.recv().await {
                self.record(frame);
            }
        })
        .await;
    }
}

/// Interactive `sh` without a user profile, so the prompt stays predictable.
pub fn interactive_sh() -> SpawnConfig {
    SpawnConfig::new("sh").env("PS1", "$ ").env("ENV", "")
}

pub fn sh(script: &str) -> SpawnConfig {
    SpawnConfig::new("sh").arg("-c").arg(script)
}

pub fn test_config(spawn: SpawnConfig) -> BridgeConfig {
    BridgeConfig {
        spawn,
        exit_drain: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

pub fn new_bridge(config: BridgeConfig) -> (Bridge, CancellationToken) {
    let token = CancellationToken::new();
    let bridge = Bridge::new(Arc::new(SessionRegistry::new()), config, token.clone());
    (bridge, token)
}

/// Poll `condition` until it holds, panicking after the test timeout.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
