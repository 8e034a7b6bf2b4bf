//! Access policy
//!
//! Decides whether a session identity may reach a given target. Targets are
//! `host:port` for forward rules and channels, `R:host:port` for reverse
//! listeners, or `socks`.

use serde::Deserialize;

/// Allow/deny decision point consulted before any listener or dial is created
pub trait AccessPolicy: Send + Sync + 'static {
    fn allow(&self, identity: &str, target: &str) -> bool;
}

/// Default policy
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow(&self, _identity: &str, _target: &str) -> bool {
        true
    }
}

/// Host/port based policy configured from the `[access]` table
#[derive(Debug, Clone, Deserialize)]
pub struct TargetPolicy {
    /// Allow traffic not matched by any rule
    #[serde(default = "default_true")]
    pub default_allow: bool,
    /// Blocked hosts (case-insensitive, trailing dot and brackets ignored)
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// Blocked ports
    #[serde(default)]
    pub blocked_ports: Vec<u16>,
    /// Allowed ports only (if not empty)
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
    /// Permit SOCKS egress
    #[serde(default = "default_true")]
    pub allow_socks: bool,
    /// Permit reverse listeners
    #[serde(default = "default_true")]
    pub allow_reverse: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            default_allow: true,
            blocked_hosts: vec![],
            blocked_ports: vec![],
            allowed_ports: vec![],
            allow_socks: true,
            allow_reverse: true,
        }
    }
}

impl AccessPolicy for TargetPolicy {
    fn allow(&self, _identity: &str, target: &str) -> bool {
        if target == crate::spec::SOCKS_TOKEN {
            return self.allow_socks;
        }

        let target = match target.strip_prefix(crate::spec::REVERSE_PREFIX) {
            Some(rest) => {
                if !self.allow_reverse {
                    return false;
                }
                rest
            }
            None => target,
        };

        let Some((host, port)) = target.rsplit_once(':') else {
            return false;
        };
        let Ok(port) = port.parse::<u16>() else {
            return false;
        };

        let host = normalize_host(host);
        if self.blocked_hosts.iter().any(|h| normalize_host(h) == host) {
            return false;
        }
        if self.blocked_ports.contains(&port) {
            return false;
        }
        if !self.allowed_ports.is_empty() && !self.allowed_ports.contains(&port) {
            return false;
        }

        self.default_allow
    }
}

/// Canonical host form for comparison: no brackets, no trailing dot, lower case
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}
