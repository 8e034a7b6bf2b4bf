//! Forwarding rules
//!
//! One [`ForwardSpec`] describes one tunnel: where to listen, where to dial,
//! which protocol and which direction. Rules are parsed from the compact text
//! form `[R:]<local-host>:<local-port>:<remote-host>:<remote-port>[/udp]`.

mod parse;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::{TcpListener, UdpSocket};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use parse::parse_target;

/// Marker prefix for reverse rules
pub const REVERSE_PREFIX: &str = "R:";

/// Bare token selecting a SOCKS5 egress on the remote side
pub const SOCKS_TOKEN: &str = "socks";

/// Bare token binding the local side to stdin/stdout
pub const STDIO_TOKEN: &str = "stdio";

pub(crate) const DEFAULT_LOCAL_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Rule parse failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("invalid rule '{0}': expected 1 to 4 colon separated parts")]
    TokenCount(String),

    #[error("invalid rule '{0}': unbalanced brackets")]
    Brackets(String),

    #[error("invalid rule '{rule}': missing port before host '{host}'")]
    MissingPort { rule: String, host: String },

    #[error("invalid rule '{rule}': invalid host '{host}'")]
    InvalidHost { rule: String, host: String },

    #[error("invalid rule '{rule}': invalid port '{port}'")]
    InvalidPort { rule: String, port: String },

    #[error("invalid rule '{0}': cross-protocol rules are not supported")]
    CrossProtocol(String),

    #[error("invalid rule '{0}': only tcp socks is supported")]
    SocksOverUdp(String),

    #[error("invalid rule '{0}': stdio rules cannot be reversed")]
    ReverseStdio(String),
}

/// Transport protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed forwarding rule with defaults applied
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardSpec {
    /// Host the listening side binds to
    pub local_host: String,
    /// Port the listening side binds to (absent only for a bare `stdio` rule)
    pub local_port: Option<u16>,
    /// Host the dialing side connects to (empty for socks targets)
    pub remote_host: String,
    /// Port the dialing side connects to (absent for socks and bare `stdio`)
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    /// Listener lives on the server, dialer on the client
    pub reverse: bool,
    /// Remote side is a SOCKS5 egress
    pub socks: bool,
    /// Local side is the process's stdin/stdout
    pub stdio: bool,
}

impl ForwardSpec {
    /// Parse a textual rule
    pub fn parse(rule: &str) -> Result<Self, SpecError> {
        parse::parse_rule(rule)
    }

    /// Canonical textual form; parses back to an equal value
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if self.reverse {
            out.push_str(REVERSE_PREFIX);
        }
        out.push_str(&self.local_endpoint());
        if let Some(remote) = self.remote_endpoint() {
            out.push(':');
            out.push_str(&remote);
            if self.protocol == Protocol::Udp {
                out.push_str("/udp");
            }
        }
        out
    }

    /// Address the listening side binds (`host:port`)
    pub fn local_addr(&self) -> String {
        let port = self.local_port.or(self.remote_port).unwrap_or(0);
        format!("{}:{}", self.local_host, port)
    }

    /// Address the dialing side connects to (`host:port`), `None` for socks
    pub fn remote_addr(&self) -> Option<String> {
        if self.socks {
            return None;
        }
        self.remote_port
            .map(|port| format!("{}:{}", self.remote_host, port))
    }

    /// Metadata attached to every channel opened for this rule
    pub fn channel_metadata(&self) -> Option<String> {
        if self.socks {
            return Some(SOCKS_TOKEN.to_string());
        }
        let addr = self.remote_addr()?;
        Some(match self.protocol {
            Protocol::Tcp => addr,
            Protocol::Udp => format!("{}/udp", addr),
        })
    }

    /// The string an access policy sees for this rule
    pub fn access_target(&self) -> String {
        if self.reverse {
            return format!("{}{}", REVERSE_PREFIX, self.local_addr());
        }
        self.remote_addr()
            .unwrap_or_else(|| SOCKS_TOKEN.to_string())
    }

    /// Probe whether the local side could be bound right now
    pub fn can_listen(&self) -> bool {
        if self.stdio {
            return true;
        }
        let addr = self.local_addr();
        match self.protocol {
            Protocol::Tcp => TcpListener::bind(addr.as_str()).is_ok(),
            Protocol::Udp => UdpSocket::bind(addr.as_str()).is_ok(),
        }
    }

    fn local_endpoint(&self) -> String {
        if self.stdio {
            return STDIO_TOKEN.to_string();
        }
        self.local_addr()
    }

    fn remote_endpoint(&self) -> Option<String> {
        if self.socks {
            return Some(SOCKS_TOKEN.to_string());
        }
        self.remote_addr()
    }
}

impl std::str::FromStr for ForwardSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Human readable `local=>remote` form with default hosts elided
impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            f.write_str(REVERSE_PREFIX)?;
        }
        let local = self.local_endpoint();
        let local = local
            .strip_prefix(&format!("{}:", DEFAULT_LOCAL_HOST))
            .map(str::to_string)
            .unwrap_or(local);
        let remote = self.remote_endpoint().unwrap_or_default();
        let remote = remote
            .strip_prefix(&format!("{}:", DEFAULT_REMOTE_HOST))
            .map(str::to_string)
            .unwrap_or(remote);
        write!(f, "{}=>{}", local, remote)?;
        if self.protocol == Protocol::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

/// Parse a list of rules, failing on the first bad one
pub fn parse_all<I, S>(rules: I) -> Result<Vec<ForwardSpec>, SpecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .map(|r| ForwardSpec::parse(r.as_ref()))
        .collect()
}

/// Encode a list of rules for the handshake payload
pub fn encode_all(specs: &[ForwardSpec]) -> Vec<String> {
    specs.iter().map(ForwardSpec::encode).collect()
}

/// Dial target carried in channel metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `host:port`
    Tcp(String),
    /// `host:port/udp`
    Udp(String),
    /// `socks`
    Socks,
}

impl Target {
    /// Address the access policy is asked about
    pub fn access_target(&self) -> &str {
        match self {
            Target::Tcp(addr) | Target::Udp(addr) => addr,
            Target::Socks => SOCKS_TOKEN,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp(addr) => f.write_str(addr),
            Target::Udp(addr) => write!(f, "{}/udp", addr),
            Target::Socks => f.write_str(SOCKS_TOKEN),
        }
    }
}
