//! Session registry
//!
//! Lock-sharded map of live sessions with a hard capacity.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::state::{SessionEntry, SessionId, SessionInfo};
use crate::session::SessionHandle;

/// Tracks every client session the server holds
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    next_id: AtomicU64,
    /// Slots taken, reserved before the entry is inserted
    occupied: AtomicUsize,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::with_capacity(max_sessions.min(1024)),
            next_id: AtomicU64::new(1),
            occupied: AtomicUsize::new(0),
            max_sessions,
        })
    }

    /// Admit a new peer; `None` when at capacity
    pub fn register(&self, peer: SocketAddr) -> Option<SessionId> {
        let max = self.max_sessions;
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        let id = SessionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(id, SessionEntry::new(id, peer));
        debug!(session_id = %id, %peer, "Session registered");
        Some(id)
    }

    /// Attach the transport session so shutdown can close it
    pub fn attach(&self, id: SessionId, session: SessionHandle) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.session = Some(session);
        }
    }

    /// Handshake accepted
    pub fn activate(&self, id: SessionId, rules: Vec<String>) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.set_active(rules);
            info!(session_id = %id, peer = %entry.peer, rules = ?entry.rules, "Session active");
        }
    }

    pub fn unregister(&self, id: SessionId) {
        if let Some((_, entry)) = self.sessions.remove(&id) {
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            info!(
                session_id = %id,
                peer = %entry.peer,
                duration_secs = entry.duration().as_secs_f64(),
                "Session ended"
            );
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_full(&self) -> bool {
        self.occupied.load(Ordering::Acquire) >= self.max_sessions
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.to_info()).collect()
    }

    /// Log one line per live session; returns how many were logged
    pub fn report(&self) -> usize {
        let sessions = self.list();
        for info in &sessions {
            info!(
                session_id = %info.id,
                peer = %info.peer,
                phase = %info.phase,
                duration_secs = info.duration_secs,
                rules = ?info.rules,
                "Session"
            );
        }
        sessions.len()
    }

    /// Mark every session draining and close its transport
    pub fn close_all(&self, reason: &str) {
        info!(sessions = self.session_count(), "Closing all sessions");
        for mut entry in self.sessions.iter_mut() {
            entry.set_draining();
            if let Some(session) = &entry.session {
                session.close(reason);
            }
        }
    }

    /// Wait for sessions to unregister, up to `timeout`
    pub async fn drain(&self, timeout: Duration) {
        let start = tokio::time::Instant::now();
        while self.session_count() > 0 && start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.session_count();
        if remaining > 0 {
            warn!(remaining, "Sessions still open after drain timeout");
        } else {
            info!("All sessions drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{memory, TransportSession};
    use crate::connection::SessionPhase;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn lookup(registry: &SessionRegistry, id: SessionId) -> Option<SessionInfo> {
        registry.list().into_iter().find(|info| info.id == id.to_string())
    }

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new(10);
        let id = registry.register(addr(4000)).unwrap();
        assert_eq!(registry.session_count(), 1);
        assert_eq!(lookup(&registry, id).unwrap().phase, "Handshaking");

        registry.activate(id, vec!["0.0.0.0:3000:example.com:80".into()]);
        let info = lookup(&registry, id).unwrap();
        assert_eq!(info.phase, format!("{:?}", SessionPhase::Active));
        assert_eq!(info.rules.len(), 1);

        registry.unregister(id);
        assert_eq!(registry.session_count(), 0);
        assert!(lookup(&registry, id).is_none());
    }

    #[test]
    fn test_capacity() {
        let registry = SessionRegistry::new(2);
        let first = registry.register(addr(1)).unwrap();
        let second = registry.register(addr(2)).unwrap();
        assert_ne!(first, second);
        assert!(registry.is_full());
        assert!(registry.register(addr(3)).is_none());

        registry.unregister(first);
        assert!(registry.register(addr(3)).is_some());
    }

    #[test]
    fn test_concurrent_register_respects_capacity() {
        let registry = SessionRegistry::new(4);
        let admitted = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for port in 0..32u16 {
                let registry = &registry;
                let admitted = &admitted;
                scope.spawn(move || {
                    if registry.register(addr(port)).is_some() {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::Relaxed), 4);
        assert_eq!(registry.session_count(), 4);
        assert!(registry.is_full());
    }

    #[test]
    fn test_report_lists_live_sessions() {
        let registry = SessionRegistry::new(4);
        assert_eq!(registry.report(), 0);
        let id = registry.register(addr(1)).unwrap();
        registry.register(addr(2)).unwrap();
        assert_eq!(registry.report(), 2);

        registry.unregister(id);
        assert_eq!(registry.report(), 1);
        assert_eq!(registry.list()[0].peer, "127.0.0.1:2");
    }

    #[tokio::test]
    async fn test_close_all_closes_transports() {
        let registry = SessionRegistry::new(4);
        let (near, far) = memory::pair();
        let id = registry.register(addr(5)).unwrap();
        registry.attach(id, near);

        registry.close_all("server shutdown");
        far.closed().await;
        assert!(far.is_closed());
        assert_eq!(lookup(&registry, id).unwrap().phase, "Draining");

        registry.unregister(id);
        registry.drain(Duration::from_secs(1)).await;
        assert_eq!(registry.session_count(), 0);
    }
}
