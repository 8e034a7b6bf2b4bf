use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use quictun::access::{AllowAll, TargetPolicy};
use quictun::reconnect::{ReconnectError, ReconnectPolicy};
use quictun::session::{memory, SessionError, TransportSession};
use quictun::tunnel::{InboundRules, TunnelManager};

use crate::{connect_retry, free_port, settings, tcp_echo, tunnel_config, Harness};

#[tokio::test]
async fn test_forward_tcp_round_trip() {
    let echo = tcp_echo().await;
    let port = free_port();
    let rule = format!("127.0.0.1:{}:{}", port, echo);
    let harness = Harness::start(
        &[rule.as_str()],
        settings(false),
        Arc::new(AllowAll),
        ReconnectPolicy::default(),
    )
    .await;

    let mut stream = connect_retry(port).await;
    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    // Closing our side ends the relay; the far side closes too
    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_many_connections_share_one_session() {
    let echo = tcp_echo().await;
    let port = free_port();
    let rule = format!("127.0.0.1:{}:{}", port, echo);
    let harness = Harness::start(
        &[rule.as_str()],
        settings(false),
        Arc::new(AllowAll),
        ReconnectPolicy::default(),
    )
    .await;
    drop(connect_retry(port).await);

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        tasks.push(tokio::spawn(async move {
            let mut stream = connect_retry(port).await;
            let payload = vec![i; 4096];
            stream.write_all(&payload).await.unwrap();
            let mut back = vec![0u8; payload.len()];
            stream.read_exact(&mut back).await.unwrap();
            assert_eq!(back, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_reverse_tcp_round_trip() {
    let echo = tcp_echo().await;
    let port = free_port();
    let rule = format!("R:127.0.0.1:{}:{}", port, echo);
    let harness = Harness::start(
        &[rule.as_str()],
        settings(true),
        Arc::new(AllowAll),
        ReconnectPolicy::default(),
    )
    .await;

    // The server listens; the client dials the echo target
    let mut stream = connect_retry(port).await;
    stream.write_all(b"reverse").await.unwrap();
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"reverse");

    harness.stop().await;
}

#[tokio::test]
async fn test_reverse_refused_without_permission() {
    let port = free_port();
    let rule = format!("R:127.0.0.1:{}:127.0.0.1:22", port);
    let harness = Harness::start(
        &[rule.as_str()],
        settings(false),
        Arc::new(AllowAll),
        ReconnectPolicy {
            max_attempts: 1,
            ..Default::default()
        },
    )
    .await;

    let err = harness.client.await.unwrap().unwrap_err();
    let ReconnectError::MaxAttemptsReached { last_error, .. } = err;
    assert!(last_error.contains("reverse port forwarding not enabled"));
    assert!(harness.server.await.unwrap().is_err());
}

#[tokio::test]
async fn test_denied_target_is_never_dialed() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let policy = TargetPolicy {
        blocked_ports: vec![target_addr.port()],
        ..Default::default()
    };
    let tunnel = TunnelManager::new(
        tunnel_config(),
        Arc::new(policy),
        InboundRules {
            channels: true,
            socks: false,
        },
    );
    let (opener, receiver) = memory::pair();
    let cancel = CancellationToken::new();
    let serving = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.run_session(receiver, cancel).await })
    };

    let result = opener.open_channel(&target_addr.to_string()).await;
    match result {
        Err(SessionError::Rejected(reason)) => assert!(reason.contains("denied")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("channel to a denied target was accepted"),
    }

    let accepted = tokio::time::timeout(Duration::from_millis(200), target.accept()).await;
    assert!(accepted.is_err(), "denied target was dialed");

    cancel.cancel();
    serving.await.unwrap().unwrap();
}
