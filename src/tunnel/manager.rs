//! Session ownership and forwarder lifecycle

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{dispatch, TunnelError, WaitError};
use crate::access::AccessPolicy;
use crate::config::TunnelConfig;
use crate::forward::Forwarder;
use crate::handshake::{PING_REQUEST, PONG_REPLY};
use crate::metrics::METRICS;
use crate::session::{Reply, SessionHandle};
use crate::spec::ForwardSpec;

/// What this side accepts from the peer
#[derive(Debug, Clone, Copy, Default)]
pub struct InboundRules {
    /// Accept channel-open requests at all
    pub channels: bool,
    /// Serve SOCKS5 on `socks` channels
    pub socks: bool,
}

/// Session slot state machine
#[derive(Clone, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(SessionHandle),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected(_) => "connected",
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Holds the single live session and hands it out to forwarders
pub struct TunnelManager {
    state: RwLock<SessionState>,
    /// Bumped on every bind/unbind so waiters re-check the slot
    generation: watch::Sender<u64>,
    config: TunnelConfig,
    policy: Arc<dyn AccessPolicy>,
    inbound: InboundRules,
}

impl TunnelManager {
    pub fn new(
        config: TunnelConfig,
        policy: Arc<dyn AccessPolicy>,
        inbound: InboundRules,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            state: RwLock::new(SessionState::Disconnected),
            generation,
            config,
            policy,
            inbound,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    pub fn inbound(&self) -> InboundRules {
        self.inbound
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Non-blocking view of the bound session
    pub fn session(&self) -> Option<SessionHandle> {
        match &*self.state.read() {
            SessionState::Connected(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Mark a connection attempt in progress
    pub fn set_connecting(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Disconnected) {
            *state = SessionState::Connecting;
        }
    }

    /// Back out of a failed attempt; a bound session is left alone
    pub fn clear_connecting(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Connecting) {
            *state = SessionState::Disconnected;
        }
    }

    /// Install a session; refuses to overwrite a live one
    pub fn bind(&self, session: SessionHandle) -> Result<(), TunnelError> {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Connected(_)) {
                return Err(TunnelError::AlreadyBound);
            }
            *state = SessionState::Connected(session);
        }
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Clear the slot and wake every waiter
    pub fn unbind(&self) {
        *self.state.write() = SessionState::Disconnected;
        self.generation.send_modify(|g| *g += 1);
    }

    /// Current session, waiting up to the configured session wait
    pub async fn current_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, WaitError> {
        self.current_session_timeout(self.config.session_wait, cancel)
            .await
    }

    /// Current session, waiting up to `timeout` for one to be bound
    pub async fn current_session_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, WaitError> {
        // Subscribe before looking so a concurrent bind is not missed
        let mut changes = self.generation.subscribe();
        if let Some(session) = self.session() {
            return Ok(session);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(WaitError::Unavailable),
            changed = changes.changed() => match changed {
                Ok(()) => self.session().ok_or(WaitError::Unavailable),
                Err(_) => Err(WaitError::Unavailable),
            },
        }
    }

    /// Bind `session` and serve it until it ends or `cancel` fires
    pub async fn run_session(
        self: &Arc<Self>,
        session: SessionHandle,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        self.run_session_with(session, Vec::new(), cancel).await
    }

    /// Like [`run_session`](Self::run_session), also running `forwarders`
    /// for exactly the lifetime of the session
    pub async fn run_session_with(
        self: &Arc<Self>,
        session: SessionHandle,
        forwarders: Vec<ForwardSpec>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        self.bind(session.clone())?;
        METRICS.session_opened();
        let peer = session.identity().to_string();
        debug!(%peer, forwarders = forwarders.len(), "Session bound");

        let session_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        if let Some(interval) = self.config.keepalive {
            tasks.spawn(keepalive(session.clone(), interval));
        }
        tasks.spawn(serve_requests(session.clone()));
        tasks.spawn(dispatch::serve_channels(
            self.clone(),
            session.clone(),
            session_cancel.clone(),
        ));
        if !forwarders.is_empty() {
            tasks.spawn(run_forwarder_set(
                self.clone(),
                forwarders,
                session_cancel.clone(),
            ));
        }

        tokio::select! {
            _ = session.closed() => debug!(%peer, "Session ended"),
            _ = cancel.cancelled() => session.close("shutting down"),
        }

        session_cancel.cancel();
        tasks.shutdown().await;
        self.unbind();
        METRICS.session_closed();
        Ok(())
    }

    /// Run listening forwarders until all of them finish or `cancel` fires
    pub async fn run_forwarders(self: &Arc<Self>, specs: Vec<ForwardSpec>, cancel: CancellationToken) {
        run_forwarder_set(self.clone(), specs, cancel).await
    }
}

/// One task per forwarder; a failing forwarder never stops the others
async fn run_forwarder_set(
    tunnel: Arc<TunnelManager>,
    specs: Vec<ForwardSpec>,
    cancel: CancellationToken,
) {
    let mut forwarders = JoinSet::new();
    for spec in specs {
        let forwarder = Forwarder::new(spec, tunnel.clone());
        let cancel = cancel.clone();
        forwarders.spawn(async move {
            let rule = forwarder.spec().to_string();
            if let Err(e) = forwarder.run(cancel).await {
                warn!(%rule, error = %e, "Forwarder stopped");
            }
        });
    }

    tokio::select! {
        _ = async { while forwarders.join_next().await.is_some() {} } => {}
        _ = cancel.cancelled() => {}
    }
    forwarders.shutdown().await;
}

/// Periodic liveness probe; tears the session down on any failure
async fn keepalive(session: SessionHandle, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let probe = tokio::time::timeout(interval, session.request(PING_REQUEST, Bytes::new()));
        match probe.await {
            Ok(Ok(reply)) if reply.ok && reply.payload == PONG_REPLY => {
                debug!(peer = %session.identity(), "Keepalive ok");
            }
            Ok(Ok(reply)) => {
                warn!(peer = %session.identity(), reply = %reply.text(), "Unexpected keepalive reply");
                session.close("keepalive failed");
                return;
            }
            Ok(Err(e)) if e.is_benign() => return,
            Ok(Err(e)) => {
                warn!(peer = %session.identity(), error = %e, "Keepalive failed");
                session.close("keepalive failed");
                return;
            }
            Err(_) => {
                warn!(peer = %session.identity(), "Keepalive timed out");
                session.close("keepalive timed out");
                return;
            }
        }
    }
}

/// Answer control requests arriving after the handshake
async fn serve_requests(session: SessionHandle) {
    while let Some(request) = session.accept_request().await {
        match request.name.as_str() {
            PING_REQUEST => request.respond(Reply::ok(PONG_REPLY)),
            other => {
                debug!(name = other, "Unknown control request");
                let reply = Reply::fail(format!("unknown request '{}'", other));
                request.respond(reply);
            }
        }
    }
}
