//! Per-connection bridge between a client channel and a shell.
//!
//! Each connection moves through `Connecting → Active → Terminated`. While
//! active, four routes run side by side:
//!
//! 1. shell output → channel, in a pump task that also sends heartbeats
//! 2. channel input → shell, in a writer task
//! 3. channel resize → PTY, inline
//! 4. shell exit, disconnect, fatal channel error or server shutdown → teardown
//!
//! Teardown only ever runs on the connection's own task, once.

use crate::channel::{ChannelSink, ChannelSource};
use crate::protocol::{ChannelEvent, SPAWN_FAILURE_NOTICE, TERMINATION_NOTICE, TransportError};
use crate::record::{ConnectionId, ConnectionRecord};
use crate::registry::SessionRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use webterm_pty::{ProcessEvents, ProcessExit, ProcessHandle, SpawnConfig};

/// Upper bound for sending the final notice and close frame.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub spawn: SpawnConfig,
    pub ping_interval: Duration,
    /// How long to keep forwarding trailing output after the shell exits.
    pub exit_drain: Duration,
    /// Input chunks queued for the shell. Input arriving while the queue is
    /// full is dropped.
    pub input_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spawn: SpawnConfig::default(),
            ping_interval: Duration::from_secs(25),
            exit_drain: Duration::from_millis(500),
            input_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Active,
    Terminated,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    SpawnFailed(String),
    ProcessExited(ProcessExit),
    ClientDisconnected(String),
    TransportFailed(TransportError),
    ServerShutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::SpawnFailed(e) => write!(f, "failed to start shell: {e}"),
            TerminationReason::ProcessExited(exit) => match &exit.signal {
                Some(signal) => write!(f, "shell terminated by {signal}"),
                None => write!(f, "shell exited with code {}", exit.code),
            },
            TerminationReason::ClientDisconnected(reason) => {
                write!(f, "client disconnected: {reason}")
            }
            TerminationReason::TransportFailed(e) => write!(f, "transport failed: {e}"),
            TerminationReason::ServerShutdown => write!(f, "server shutting down"),
        }
    }
}

enum PumpEnd {
    OutputClosed,
    SinkFailed(TransportError),
    Cancelled,
}

/// Creates and runs bridges for incoming channels.
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<SessionRegistry>,
    config: Arc<BridgeConfig>,
    shutdown: CancellationToken,
}

impl Bridge {
    /// `shutdown` is the server-wide token; each connection derives a child
    /// from it.
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: BridgeConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Serve one channel until the session ends.
    pub async fn run<S, K>(&self, id: ConnectionId, source: S, sink: K) -> TerminationReason
    where
        S: ChannelSource,
        K: ChannelSink,
    {
        let span = info_span!("connection", conn_id = %id);
        let connection = Connection {
            id,
            state: BridgeState::Connecting,
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            token: self.shutdown.child_token(),
        };
        connection.run(source, sink).instrument(span).await
    }
}

struct Connection {
    id: ConnectionId,
    state: BridgeState,
    registry: Arc<SessionRegistry>,
    config: Arc<BridgeConfig>,
    token: CancellationToken,
}

impl Connection {
    fn transition(&mut self, to: BridgeState) {
        debug!(from = ?self.state, to = ?to, "Bridge state change");
        self.state = to;
    }

    async fn run<S, K>(mut self, source: S, mut sink: K) -> TerminationReason
    where
        S: ChannelSource,
        K: ChannelSink,
    {
        info!("Client connected");

        let (handle, events) = match self.spawn().await {
            Ok(spawned) => spawned,
            Err(reason) => {
                self.transition(BridgeState::Terminated);
                farewell(&mut sink, SPAWN_FAILURE_NOTICE, &reason).await;
                info!(%reason, "Session ended");
                return reason;
            }
        };

        let record = Arc::new(ConnectionRecord::new(self.id, Arc::clone(&handle)));
        if let Err(e) = self.registry.insert(Arc::clone(&record)) {
            error!(error = %e, "Failed to register session");
            kill(&handle).await;
            let reason = TerminationReason::SpawnFailed(e.to_string());
            self.transition(BridgeState::Terminated);
            farewell(&mut sink, SPAWN_FAILURE_NOTICE, &reason).await;
            return reason;
        }

        self.transition(BridgeState::Active);
        info!(pid = ?handle.pid(), size = %handle.size(), "Shell started");

        let reason = self.active(&record, events, source, sink).await;
        info!(%reason, "Session ended");
        reason
    }

    async fn spawn(&self) -> Result<(Arc<ProcessHandle>, ProcessEvents), TerminationReason> {
        let config = self.config.spawn.clone();
        match tokio::task::spawn_blocking(move || ProcessHandle::spawn(&config)).await {
            Ok(Ok((handle, events))) => Ok((Arc::new(handle), events)),
            Ok(Err(e)) => {
                error!(error = %e, "Failed to start shell");
                Err(TerminationReason::SpawnFailed(e.to_string()))
            }
            Err(e) => {
                error!(error = %e, "Shell spawn task failed");
                Err(TerminationReason::SpawnFailed(e.to_string()))
            }
        }
    }

    async fn active<S, K>(
        &mut self,
        record: &Arc<ConnectionRecord>,
        events: ProcessEvents,
        mut source: S,
        sink: K,
    ) -> TerminationReason
    where
        S: ChannelSource,
        K: ChannelSink,
    {
        let handle = Arc::clone(record.process());
        let ProcessEvents { output, mut exit } = events;

        let mut pump = tokio::spawn(
            pump_output(output, sink, self.token.clone(), self.config.ping_interval)
                .in_current_span(),
        );
        let (input_tx, input_rx) = mpsc::channel(self.config.input_buffer.max(1));
        let writer = tokio::spawn(write_input(Arc::clone(&handle), input_rx).in_current_span());

        // Set once the pump task has finished, holding its sink if it survived.
        let mut pumped: Option<Option<K>> = None;
        let mut input_stalled = false;
        let reason = loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break TerminationReason::ServerShutdown,

                result = &mut exit => break TerminationReason::ProcessExited(exit_or_unknown(result)),

                finished = &mut pump => {
                    let end = match finished {
                        Ok((sink, end)) => {
                            pumped = Some(Some(sink));
                            end
                        }
                        Err(e) => {
                            pumped = Some(None);
                            PumpEnd::SinkFailed(TransportError::Socket(e.to_string()))
                        }
                    };
                    match end {
                        PumpEnd::OutputClosed => {
                            let result = tokio::time::timeout(self.config.exit_drain, &mut exit).await;
                            break TerminationReason::ProcessExited(match result {
                                Ok(result) => exit_or_unknown(result),
                                Err(_) => unknown_exit(),
                            });
                        }
                        PumpEnd::SinkFailed(e) => break TerminationReason::TransportFailed(e),
                        PumpEnd::Cancelled => break TerminationReason::ServerShutdown,
                    }
                }

                event = source.next_event() => match event {
                    ChannelEvent::Input(data) => {
                        trace!(bytes = data.len(), "Input");
                        // Never wait on the shell here, or a disconnect would go unseen.
                        match input_tx.try_send(data) {
                            Ok(()) => input_stalled = false,
                            Err(TrySendError::Full(data)) => {
                                if !input_stalled {
                                    warn!(bytes = data.len(), "Shell is not reading input, dropping input");
                                    input_stalled = true;
                                } else {
                                    debug!(bytes = data.len(), "Dropping input");
                                }
                            }
                            Err(TrySendError::Closed(_)) => debug!("Input route closed, dropping input"),
                        }
                    }
                    ChannelEvent::Resize(size) => {
                        match handle.resize(size.rows(), size.cols()) {
                            Ok(()) => debug!(%size, "Terminal resized"),
                            Err(e) if e.is_exited() => debug!(%size, "Ignoring resize for exited shell"),
                            Err(e) => warn!(%size, error = %e, "Failed to resize terminal"),
                        }
                    }
                    ChannelEvent::Error(e) if e.is_fatal() => {
                        break TerminationReason::TransportFailed(e);
                    }
                    ChannelEvent::Error(e) => {
                        let count = record.record_error();
                        warn!(error = %e, count, "Transport error");
                    }
                    ChannelEvent::Disconnect(reason) => {
                        break TerminationReason::ClientDisconnected(reason);
                    }
                },
            }
        };

        self.transition(BridgeState::Terminated);
        drop(input_tx);

        // Let trailing output reach the client before the pump is stopped.
        if pumped.is_none() && matches!(reason, TerminationReason::ProcessExited(_)) {
            if let Ok(finished) = tokio::time::timeout(self.config.exit_drain, &mut pump).await {
                pumped = Some(finished.ok().map(|(sink, _)| sink));
            }
        }
        self.token.cancel();
        let sink = match pumped {
            Some(sink) => sink,
            None => pump.await.ok().map(|(sink, _)| sink),
        };

        self.teardown(&handle, sink, &reason).await;
        writer.abort();
        reason
    }

    /// Kill the shell, deregister, then say goodbye if the channel is open.
    async fn teardown<K: ChannelSink>(
        &self,
        handle: &Arc<ProcessHandle>,
        sink: Option<K>,
        reason: &TerminationReason,
    ) {
        kill(handle).await;
        self.registry.remove(&self.id);
        if let Some(mut sink) = sink {
            farewell(&mut sink, TERMINATION_NOTICE, reason).await;
        }
    }
}

/// Release the shell. Runs on the blocking pool because kill may wait briefly.
async fn kill(handle: &Arc<ProcessHandle>) {
    let handle = Arc::clone(handle);
    match tokio::task::spawn_blocking(move || handle.kill()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to kill shell"),
        Err(e) => warn!(error = %e, "Shell kill task failed"),
    }
}

async fn farewell<K: ChannelSink>(sink: &mut K, notice: &[u8], reason: &TerminationReason) {
    if !sink.is_open() {
        return;
    }
    let reason = reason.to_string();
    let result = tokio::time::timeout(FAREWELL_TIMEOUT, async {
        if let Err(e) = sink.send_output(notice.to_vec()).await {
            debug!(error = %e, "Could not send termination notice");
        }
        sink.close(&reason).await;
    })
    .await;
    if result.is_err() {
        debug!("Timed out closing channel");
    }
}

fn exit_or_unknown(result: Result<ProcessExit, oneshot::error::RecvError>) -> ProcessExit {
    result.unwrap_or_else(|_| unknown_exit())
}

fn unknown_exit() -> ProcessExit {
    ProcessExit {
        code: 1,
        signal: None,
    }
}

/// Forward shell output to the channel until either side ends.
///
/// Hands the sink back so teardown can still use it.
async fn pump_output<K: ChannelSink>(
    mut output: mpsc::Receiver<Vec<u8>>,
    mut sink: K,
    token: CancellationToken,
    ping_interval: Duration,
) -> (K, PumpEnd) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval.max(Duration::from_millis(1)),
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break PumpEnd::Cancelled,
            chunk = output.recv() => {
                let Some(chunk) = chunk else {
                    break PumpEnd::OutputClosed;
                };
                trace!(bytes = chunk.len(), "Output");
                let sent = tokio::select! {
                    sent = sink.send_output(chunk) => sent,
                    _ = token.cancelled() => break PumpEnd::Cancelled,
                };
                if let Err(e) = sent {
                    break PumpEnd::SinkFailed(e);
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.heartbeat().await {
                    break PumpEnd::SinkFailed(e);
                }
            }
        }
    };
    (sink, end)
}

/// Feed queued input to the shell, one chunk at a time, in order.
async fn write_input(handle: Arc<ProcessHandle>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        let handle = Arc::clone(&handle);
        match tokio::task::spawn_blocking(move || handle.write(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_exited() => debug!("Dropping input for exited shell"),
            Ok(Err(e)) => warn!(error = %e, "Failed to write to shell"),
            Err(e) => {
                warn!(error = %e, "Shell write task failed");
                break;
            }
        }
    }
}
