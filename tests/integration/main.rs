//! End-to-end tunnel tests over an in-memory session pair

mod tcp_forward;
mod udp_forward;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use quictun::access::AccessPolicy;
use quictun::client::{Client, SessionQueue};
use quictun::config::TunnelConfig;
use quictun::reconnect::{ReconnectError, ReconnectPolicy};
use quictun::server::{serve_session, ServerSettings};
use quictun::session::{memory, SessionHandle};
use quictun::spec::parse_all;
use quictun::tunnel::TunnelError;

/// A client and a server joined by one in-memory session
pub struct Harness {
    pub client: JoinHandle<Result<(), ReconnectError>>,
    pub server: JoinHandle<Result<(), TunnelError>>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn start(
        rules: &[&str],
        settings: ServerSettings,
        policy: Arc<dyn AccessPolicy>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (client_end, server_end) = memory::pair_named("client", "server");

        let server = {
            let cancel = cancel.clone();
            let server_end: SessionHandle = server_end;
            tokio::spawn(async move { serve_session(server_end, &settings, policy, cancel).await })
        };

        let (sessions, queue) = SessionQueue::channel();
        sessions.send(client_end).await.unwrap();
        let specs = parse_all(rules).unwrap();
        let client = Client::new(specs, tunnel_config(), reconnect, Arc::new(queue)).unwrap();
        let client = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Keep the queue's sender alive so later attempts wait instead of failing
                let _sessions = sessions;
                client.run(cancel).await
            })
        };

        Self {
            client,
            server,
            cancel,
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.client.await.unwrap();
        let _ = self.server.await.unwrap();
    }
}

pub fn tunnel_config() -> TunnelConfig {
    TunnelConfig {
        keepalive: None,
        session_wait: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn settings(reverse: bool) -> ServerSettings {
    ServerSettings {
        reverse,
        socks5: false,
        tunnel: tunnel_config(),
    }
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// TCP echo server; returns its address
pub async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// UDP echo server; returns its address
pub async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Connect, retrying while the forwarder comes up
pub async fn connect_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {port}");
}
