use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use quictun::access::AllowAll;
use quictun::reconnect::ReconnectPolicy;

use crate::{free_udp_port, settings, udp_echo, Harness};

/// Send until a reply arrives; the forwarder may still be binding
async fn exchange(socket: &UdpSocket, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    for _ in 0..50 {
        socket.send_to(payload, ("127.0.0.1", port)).await.unwrap();
        if let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await
        {
            return buf[..n].to_vec();
        }
    }
    panic!("no reply through port {port}");
}

#[tokio::test]
async fn test_udp_flows_stay_separate() {
    let echo = udp_echo().await;
    let port = free_udp_port();
    let rule = format!("127.0.0.1:{}:{}/udp", port, echo);
    let harness = Harness::start(
        &[rule.as_str()],
        settings(false),
        Arc::new(AllowAll),
        ReconnectPolicy::default(),
    )
    .await;

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    assert_eq!(exchange(&first, port, b"first flow").await, b"first flow");
    assert_eq!(exchange(&second, port, b"second flow").await, b"second flow");

    // Replies go only to the flow that asked
    first.send_to(b"again", ("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), first.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"again");
    let stray = tokio::time::timeout(Duration::from_millis(200), second.recv_from(&mut buf)).await;
    assert!(stray.is_err());

    harness.stop().await;
}
