//! SOCKS5 egress served over a channel
//!
//! RFC 1928 with no authentication and the CONNECT command only. The
//! requested destination goes through the access policy before any dial.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pipe::{self, Traffic};
use super::ForwardError;
use crate::access::AccessPolicy;
use crate::session::Channel;
use crate::util;

/// SOCKS5 version
pub const VERSION: u8 = 0x05;

/// Authentication methods
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Commands
pub const CMD_CONNECT: u8 = 0x01;

/// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONN_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

fn socks_error(msg: impl Into<String>) -> ForwardError {
    ForwardError::Socks(msg.into())
}

/// Serve one SOCKS5 client arriving on `channel`
pub async fn serve(
    mut channel: Channel,
    policy: &dyn AccessPolicy,
    identity: &str,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<(), ForwardError> {
    negotiate(&mut channel).await?;

    let (cmd, host, port) = match read_request(&mut channel).await {
        Ok(request) => request,
        Err(RequestError::AddressType(atyp)) => {
            channel
                .write_all(&encode_reply(REP_ATYP_NOT_SUPPORTED, zero_bind_addr()))
                .await?;
            return Err(socks_error(format!("unsupported address type {}", atyp)));
        }
        Err(RequestError::Forward(e)) => return Err(e),
    };

    if cmd != CMD_CONNECT {
        channel
            .write_all(&encode_reply(REP_CMD_NOT_SUPPORTED, zero_bind_addr()))
            .await?;
        return Err(socks_error(format!("command {} not supported", cmd)));
    }

    let target = format_target(&host, port);
    if !policy.allow(identity, &target) {
        channel
            .write_all(&encode_reply(REP_CONN_NOT_ALLOWED, zero_bind_addr()))
            .await?;
        return Err(socks_error(format!("access to {} denied", target)));
    }

    let stream = match util::connect_tcp(&target).await {
        Ok(stream) => stream,
        Err(source) => {
            channel
                .write_all(&encode_reply(REP_HOST_UNREACHABLE, zero_bind_addr()))
                .await?;
            return Err(ForwardError::Dial {
                addr: target,
                source,
            });
        }
    };

    let bound = stream.local_addr().unwrap_or_else(|_| zero_bind_addr());
    channel.write_all(&encode_reply(REP_SUCCESS, bound)).await?;
    debug!(%target, "SOCKS5 CONNECT established");

    let traffic = Traffic::default();
    let (read, write) = stream.into_split();
    pipe::relay(
        channel.into_split(),
        (read, write),
        buffer_size,
        &traffic,
        cancel,
    )
    .await?;

    debug!(%target, sent = traffic.sent(), received = traffic.received(), "SOCKS5 CONNECT completed");
    Ok(())
}

/// Method negotiation; only "no authentication" is offered
async fn negotiate<S>(stream: &mut S) -> Result<(), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(socks_error(format!("invalid SOCKS version {}", header[0])));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let method = if methods.contains(&AUTH_NONE) {
        AUTH_NONE
    } else {
        AUTH_NO_ACCEPTABLE
    };
    stream.write_all(&[VERSION, method]).await?;

    if method == AUTH_NO_ACCEPTABLE {
        return Err(socks_error("no acceptable auth method"));
    }
    Ok(())
}

enum RequestError {
    AddressType(u8),
    Forward(ForwardError),
}

impl From<ForwardError> for RequestError {
    fn from(e: ForwardError) -> Self {
        RequestError::Forward(e)
    }
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Forward(e.into())
    }
}

async fn read_request<S>(stream: &mut S) -> Result<(u8, String, u16), RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(socks_error("invalid request version").into());
    }
    let cmd = header[1];
    let atyp = header[3];

    let mut addr = BytesMut::new();
    addr.put_u8(atyp);
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            addr.extend_from_slice(&buf);
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            addr.put_u8(len);
            let mut buf = vec![0u8; len as usize + 2];
            stream.read_exact(&mut buf).await?;
            addr.extend_from_slice(&buf);
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            addr.extend_from_slice(&buf);
        }
        other => return Err(RequestError::AddressType(other)),
    }

    let (host, port) = parse_address(&mut addr)?;
    Ok((cmd, host, port))
}

/// Parse `[atyp][addr][port]`
pub fn parse_address(data: &mut BytesMut) -> Result<(String, u16), ForwardError> {
    if data.is_empty() {
        return Err(socks_error("empty address"));
    }
    let host = match data.get_u8() {
        ATYP_IPV4 if data.remaining() >= 4 => {
            let mut octets = [0u8; 4];
            data.copy_to_slice(&mut octets);
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN if data.remaining() >= 1 => {
            let len = data.get_u8() as usize;
            if data.remaining() < len {
                return Err(socks_error("truncated domain name"));
            }
            let domain = data.copy_to_bytes(len);
            String::from_utf8(domain.to_vec()).map_err(|_| socks_error("non-UTF-8 domain"))?
        }
        ATYP_IPV6 if data.remaining() >= 16 => {
            let mut octets = [0u8; 16];
            data.copy_to_slice(&mut octets);
            Ipv6Addr::from(octets).to_string()
        }
        atyp => return Err(socks_error(format!("bad address of type {}", atyp))),
    };
    if data.remaining() < 2 {
        return Err(socks_error("missing port"));
    }
    Ok((host, data.get_u16()))
}

/// `host:port` with IPv6 literals bracketed
fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Encode SOCKS5 reply
pub fn encode_reply(status: u8, bind_addr: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(VERSION);
    buf.push(status);
    buf.push(0x00);

    match bind_addr {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
    buf
}

fn zero_bind_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}
