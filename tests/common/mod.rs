//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use intercept_proxy::config::{ServerConfig, ServerContext};
use intercept_proxy::events::{Event, EventBus};
use intercept_proxy::injectors::InjectorChain;
use intercept_proxy::recorder::Recorder;
use intercept_proxy::websocket::SessionRegistry;
use intercept_proxy::{HttpServer, Shutdown};

/// Start a mock backend that returns a fixed response on an ephemeral port.
#[allow(dead_code)]
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// An upstream WebSocket endpoint for bridged sessions.
#[allow(dead_code)]
pub struct MockUpstream {
    pub addr: SocketAddr,
    /// Text frames received, tagged with the 0-based connection number.
    pub received: mpsc::UnboundedReceiver<(usize, String)>,
}

/// Echo text frames back as `upstream: <text>`. When `close_on` arrives on
/// the first connection, that connection is closed instead.
#[allow(dead_code)]
pub async fn start_ws_upstream(close_on: Option<&'static str>) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let number = connection;
            connection += 1;
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let text = text.as_str().to_string();
                    let _ = tx.send((number, text.clone()));
                    if number == 0 && close_on == Some(text.as_str()) {
                        let _ = socket.close(None).await;
                        return;
                    }
                    let reply = format!("upstream: {text}");
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    MockUpstream { addr, received }
}

/// A server running on an ephemeral port.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub bus: EventBus,
    pub chain: InjectorChain,
    pub recorder: Arc<Recorder>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: Shutdown,
}

#[allow(dead_code)]
impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Poll until the recorder holds `count` requests.
    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..100 {
            if self.recorder.requests().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("recorder never reached {count} requests");
    }

    /// Poll until the recorder holds `count` unanswered exchanges.
    pub async fn wait_for_errors(&self, count: usize) {
        for _ in 0..100 {
            if self.recorder.errors().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("recorder never reached {count} errors");
    }
}

/// Build and start a server; returns once it reported `open`.
#[allow(dead_code)]
pub async fn start_server(config: ServerConfig) -> TestServer {
    let ctx = ServerContext::new(config);
    let bus = ctx.bus().clone();
    let mut events = bus.subscribe();

    let server = HttpServer::new(ctx);
    let chain = server.chain().clone();
    let recorder = Arc::clone(server.recorder());
    let sessions = Arc::clone(server.sessions());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(Event::Open { .. })) => break,
            Ok(Ok(_)) => continue,
            other => panic!("server did not open: {other:?}"),
        }
    }

    TestServer {
        addr,
        bus,
        chain,
        recorder,
        sessions,
        shutdown,
    }
}

#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
