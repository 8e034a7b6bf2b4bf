//! Socket creation and tuning

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

/// Socket buffer sizes for the QUIC endpoint
pub const RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB
pub const SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB

/// Pending connection backlog of forwarder listeners
const LISTEN_BACKLOG: i32 = 1024;

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Create the UDP socket the QUIC endpoint runs on
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // Best effort: the kernel may clamp these
    let _ = socket.set_recv_buffer_size(RECV_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Resolve `host:port` to the first socket address
pub async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }
    lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", addr),
        )
    })
}

/// Bind a TCP listener for a forwarder
pub async fn bind_tcp_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = resolve(addr).await?;
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Bind a UDP socket for a forwarder
pub async fn bind_udp_socket(addr: &str) -> io::Result<UdpSocket> {
    UdpSocket::bind(resolve(addr).await?).await
}

/// Dial a TCP target and tune the stream for relaying
pub async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    tune_tcp_stream(&stream)?;
    Ok(stream)
}

/// Disable Nagle and enable keepalive on a relayed stream
pub fn tune_tcp_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Create a connected transient UDP socket toward `target`
pub async fn connect_udp(target: &str) -> io::Result<UdpSocket> {
    let target = resolve(target).await?;
    let bind: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_connect_tcp() {
        let listener = bind_tcp_listener("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect_tcp(&addr.to_string()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_tune_accepted_stream() {
        let listener = bind_tcp_listener("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        tune_tcp_stream(&accepted).unwrap();
        assert!(accepted.nodelay().unwrap());
        assert!(socket2::SockRef::from(&accepted).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_connect_udp_is_connected() {
        let peer = bind_udp_socket("127.0.0.1:0").await.unwrap();
        let socket = connect_udp(&peer.local_addr().unwrap().to_string())
            .await
            .unwrap();
        socket.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, socket.local_addr().unwrap());
    }

    #[test]
    fn test_udp_socket_for_endpoint() {
        let socket = create_udp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
