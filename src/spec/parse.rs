//! Rule text parsing

use std::net::{IpAddr, Ipv6Addr};

use super::{
    ForwardSpec, Protocol, SpecError, Target, DEFAULT_LOCAL_HOST, DEFAULT_REMOTE_HOST,
    DEFAULT_SOCKS_HOST, DEFAULT_SOCKS_PORT, REVERSE_PREFIX, SOCKS_TOKEN, STDIO_TOKEN,
};

/// Parse a rule, scanning its tokens right to left
pub(super) fn parse_rule(rule: &str) -> Result<ForwardSpec, SpecError> {
    let (body, reverse) = match rule.strip_prefix(REVERSE_PREFIX) {
        Some(rest) => (rest, true),
        None => (rule, false),
    };

    let tokens = tokenize(body).ok_or_else(|| SpecError::Brackets(rule.to_string()))?;
    if tokens.is_empty() || tokens.len() > 4 {
        return Err(SpecError::TokenCount(rule.to_string()));
    }

    let mut local_host: Option<String> = None;
    let mut local_port: Option<u16> = None;
    let mut remote_host: Option<String> = None;
    let mut remote_port: Option<u16> = None;
    let mut local_proto: Option<Protocol> = None;
    let mut remote_proto: Option<Protocol> = None;
    let mut socks = false;
    let mut stdio = false;

    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate().rev() {
        if i == last && *token == SOCKS_TOKEN {
            socks = true;
            continue;
        }
        if i == 0 && *token == STDIO_TOKEN {
            stdio = true;
            continue;
        }

        let (token, proto) = split_protocol(token);
        if let Some(proto) = proto {
            if remote_port.is_none() {
                remote_proto = Some(proto);
            } else if local_proto.is_none() {
                local_proto = Some(proto);
            }
        }

        if let Some(port) = parse_port(token, rule)? {
            if !socks && remote_port.is_none() {
                remote_port = Some(port);
            }
            local_port = Some(port);
            continue;
        }

        if !socks && remote_port.is_none() && local_port.is_none() {
            return Err(SpecError::MissingPort {
                rule: rule.to_string(),
                host: token.to_string(),
            });
        }
        if !is_host(token) {
            return Err(SpecError::InvalidHost {
                rule: rule.to_string(),
                host: token.to_string(),
            });
        }
        if !socks && remote_host.is_none() {
            remote_host = Some(token.to_string());
        } else {
            local_host = Some(token.to_string());
        }
    }

    let (local_host, local_port) = if socks {
        (
            local_host.unwrap_or_else(|| DEFAULT_SOCKS_HOST.to_string()),
            local_port.or(Some(DEFAULT_SOCKS_PORT)),
        )
    } else {
        (
            local_host.unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            local_port,
        )
    };
    let remote_host = if socks {
        String::new()
    } else {
        remote_host.unwrap_or_else(|| DEFAULT_REMOTE_HOST.to_string())
    };

    let remote_proto = remote_proto.unwrap_or_default();
    let local_proto = local_proto.unwrap_or(remote_proto);
    if local_proto != remote_proto {
        return Err(SpecError::CrossProtocol(rule.to_string()));
    }
    if socks && remote_proto != Protocol::Tcp {
        return Err(SpecError::SocksOverUdp(rule.to_string()));
    }
    if stdio && reverse {
        return Err(SpecError::ReverseStdio(rule.to_string()));
    }

    Ok(ForwardSpec {
        local_host,
        local_port,
        remote_host,
        remote_port: if socks { None } else { remote_port },
        protocol: remote_proto,
        reverse,
        socks,
        stdio,
    })
}

/// Parse channel metadata (`host:port`, `host:port/udp` or `socks`)
pub fn parse_target(metadata: &str) -> Result<Target, SpecError> {
    if metadata == SOCKS_TOKEN {
        return Ok(Target::Socks);
    }
    let (addr, proto) = split_protocol(metadata);
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| SpecError::TokenCount(metadata.to_string()))?;
    if !is_host(host) {
        return Err(SpecError::InvalidHost {
            rule: metadata.to_string(),
            host: host.to_string(),
        });
    }
    if parse_port(port, metadata)?.is_none() {
        return Err(SpecError::InvalidPort {
            rule: metadata.to_string(),
            port: port.to_string(),
        });
    }
    Ok(match proto.unwrap_or_default() {
        Protocol::Tcp => Target::Tcp(addr.to_string()),
        Protocol::Udp => Target::Udp(addr.to_string()),
    })
}

/// Split into colon separated tokens, keeping `[...]` groups whole
fn tokenize(body: &str) -> Option<Vec<&str>> {
    let mut tokens = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b':' => i += 1,
            b'[' => {
                let close = body[i..].find(']')? + i;
                let inner = &body[i + 1..close];
                if inner.is_empty() || inner.contains('[') {
                    return None;
                }
                // A protocol suffix may follow the closing bracket
                let end = body[close..]
                    .find(':')
                    .map(|n| n + close)
                    .unwrap_or(body.len());
                tokens.push(&body[i..end]);
                i = end;
            }
            b']' => return None,
            _ => {
                let end = body[i..]
                    .find([':', '[', ']'])
                    .map(|n| n + i)
                    .unwrap_or(body.len());
                tokens.push(&body[i..end]);
                i = end;
            }
        }
    }
    Some(tokens)
}

/// Strip a trailing `/tcp` or `/udp` (any case)
fn split_protocol(token: &str) -> (&str, Option<Protocol>) {
    if token.len() < 4 || !token.is_char_boundary(token.len() - 4) {
        return (token, None);
    }
    let (head, suffix) = token.split_at(token.len() - 4);
    if suffix.eq_ignore_ascii_case("/tcp") {
        (head, Some(Protocol::Tcp))
    } else if suffix.eq_ignore_ascii_case("/udp") {
        (head, Some(Protocol::Udp))
    } else {
        (token, None)
    }
}

/// `Ok(None)` when the token is not numeric at all
fn parse_port(token: &str, rule: &str) -> Result<Option<u16>, SpecError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u16>() {
        Ok(port) if port > 0 => Ok(Some(port)),
        _ => Err(SpecError::InvalidPort {
            rule: rule.to_string(),
            port: token.to_string(),
        }),
    }
}

fn is_host(token: &str) -> bool {
    if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    if token.parse::<IpAddr>().is_ok() {
        return true;
    }
    !token.is_empty()
        && token.len() <= 253
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}
