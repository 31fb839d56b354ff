#![allow(dead_code)]

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use webterm::gateway::GatewayConfig;
use webterm::server::{self, AppState};
use webterm_bridge::{Bridge, BridgeConfig, SessionRegistry};
use webterm_pty::SpawnConfig;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(BridgeConfig {
            spawn: SpawnConfig::new("sh").env("PS1", "$ ").env("ENV", ""),
            ..BridgeConfig::default()
        })
        .await
    }

    pub async fn start_with(config: BridgeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(Arc::clone(&registry), config, shutdown.clone());
        let state = AppState::new(bridge, GatewayConfig::default());
        let handle = tokio::spawn(server::serve(listener, state, shutdown.clone()));
        Self {
            addr,
            registry,
            shutdown,
            handle,
        }
    }

    pub async fn connect(&self, path: &str) -> Client {
        let url = format!("ws://{}{path}", self.addr);
        let (client, _) = tokio::time::timeout(TEST_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .expect("connect in time")
            .expect("websocket handshake");
        client
    }

    /// Plain HTTP/1.1 GET, returning the raw response.
    pub async fn get(&self, path: &str, extra_headers: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\n{extra_headers}Connection: close\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        tokio::time::timeout(TEST_TIMEOUT, stream.read_to_string(&mut response))
            .await
            .expect("response in time")
            .unwrap();
        response
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while self.registry.len() != count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {count} sessions, registry has {}",
                    self.registry.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// What a client saw before it stopped reading.
#[derive(Debug, Default)]
pub struct Transcript {
    pub output: String,
    pub close_reason: Option<String>,
}

/// Read frames until the output contains `needle` or the server closes.
pub async fn read_until(client: &mut Client, needle: &str) -> Transcript {
    let mut transcript = Transcript::default();
    let mut raw = Vec::new();
    let _ = tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(Ok(message)) = client.next().await {
            match message {
                Message::Binary(data) => {
                    raw.extend_from_slice(&data);
                    if !needle.is_empty() && String::from_utf8_lossy(&raw).contains(needle) {
                        break;
                    }
                }
                Message::Close(frame) => {
                    transcript.close_reason =
                        Some(frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default());
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    transcript.output = String::from_utf8_lossy(&raw).into_owned();
    transcript
}

/// Read frames until the server closes the socket.
pub async fn read_to_close(client: &mut Client) -> Transcript {
    read_until(client, "").await
}
