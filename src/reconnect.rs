//! Client reconnect loop
//!
//! Repeatedly runs a connection attempt, sleeping with exponential backoff
//! between attempts. A session that stayed up for at least the sustained
//! threshold resets the backoff and the attempt count.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::METRICS;
use crate::tunnel::TunnelError;

/// Backoff and retry limits
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Total attempts allowed; negative means unlimited
    pub max_attempts: i64,
    /// Connected time after which a disconnect counts as a fresh start
    pub sustained_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: -1,
            sustained_after: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("giving up after {attempts} attempts: {last_error}")]
    MaxAttemptsReached { attempts: u64, last_error: String },
}

/// Exponential backoff, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            current: None,
        }
    }

    pub fn from_policy(policy: &ReconnectPolicy) -> Self {
        Self::new(policy.initial_backoff, policy.max_backoff, policy.multiplier)
    }

    /// Next delay; grows until it reaches the cap
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => {
                let grown = current.mul_f64(self.multiplier);
                // Keep growing even when the multiplier rounds to nothing
                if grown <= current {
                    current + Duration::from_millis(1)
                } else {
                    grown
                }
            }
        };
        let next = next.min(self.max);
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// Handed to each attempt so it can report when the session came up
#[derive(Debug)]
pub struct AttemptContext {
    attempt: u64,
    connected_at: Mutex<Option<Instant>>,
    state: Arc<watch::Sender<LoopState>>,
}

impl AttemptContext {
    fn new(attempt: u64, state: Arc<watch::Sender<LoopState>>) -> Self {
        Self {
            attempt,
            connected_at: Mutex::new(None),
            state,
        }
    }

    /// 1-based attempt number since the last reset
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Mark the session as established
    pub fn connected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
        self.state.send_replace(LoopState::Connected);
    }

    fn connected_for(&self) -> Option<Duration> {
        self.connected_at.lock().map(|at| at.elapsed())
    }
}

/// One connection attempt; returns when the session ends
#[async_trait]
pub trait Connect: Send + Sync {
    async fn attempt(
        &self,
        ctx: &AttemptContext,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError>;
}

/// Drives [`Connect`] attempts with backoff
pub struct ReconnectLoop {
    policy: ReconnectPolicy,
    wake: Arc<Notify>,
    state: Arc<watch::Sender<LoopState>>,
}

impl ReconnectLoop {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            policy,
            wake: Arc::new(Notify::new()),
            state: Arc::new(state),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Handle that cuts the current backoff sleep short
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Run attempts until cancelled or the attempt budget is spent
    pub async fn run<C: Connect + ?Sized>(
        &self,
        connector: &C,
        cancel: CancellationToken,
    ) -> Result<(), ReconnectError> {
        let mut backoff = Backoff::from_policy(&self.policy);
        let mut attempts: u64 = 0;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            attempts += 1;
            METRICS.reconnect_attempt();
            self.set_state(LoopState::Connecting);
            debug!(attempt = attempts, "Connecting");

            let ctx = AttemptContext::new(attempts, self.state.clone());
            let outcome = connector.attempt(&ctx, &cancel).await;
            if cancel.is_cancelled() {
                break Ok(());
            }
            self.set_state(LoopState::Disconnected);

            let sustained = ctx
                .connected_for()
                .is_some_and(|up| up >= self.policy.sustained_after);
            if sustained {
                backoff.reset();
                attempts = 0;
            }

            let last_error = match outcome {
                Ok(()) => {
                    info!("Disconnected");
                    "session ended".to_string()
                }
                Err(e) => {
                    if ctx.connected_for().is_some() {
                        info!(error = %e, "Disconnected");
                    } else {
                        warn!(attempt = attempts, error = %e, "Connection failed");
                    }
                    e.to_string()
                }
            };

            if self.policy.max_attempts >= 0 && attempts >= self.policy.max_attempts as u64 {
                break Err(ReconnectError::MaxAttemptsReached {
                    attempts,
                    last_error,
                });
            }

            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => debug!("Backoff interrupted"),
                _ = cancel.cancelled() => break Ok(()),
            }
        };

        self.set_state(LoopState::Stopped);
        result
    }
}

/// Cut the backoff short whenever the process receives SIGHUP
///
/// The handler is installed before this returns, so a hangup sent right
/// after the call is not lost.
#[cfg(unix)]
pub fn wake_on_hangup(wake: Arc<Notify>) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, retrying now");
            wake.notify_one();
        }
    }))
}

/// Shared connectors
#[async_trait]
impl<C: Connect + ?Sized> Connect for Arc<C> {
    async fn attempt(
        &self,
        ctx: &AttemptContext,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        (**self).attempt(ctx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant as TokioInstant;

    /// Fails every attempt, recording when each one started
    #[derive(Default)]
    struct Failing {
        starts: Mutex<Vec<TokioInstant>>,
    }

    #[async_trait]
    impl Connect for Failing {
        async fn attempt(
            &self,
            _ctx: &AttemptContext,
            _cancel: &CancellationToken,
        ) -> Result<(), TunnelError> {
            self.starts.lock().push(TokioInstant::now());
            Err(TunnelError::Connect("refused".into()))
        }
    }

    fn policy(max_attempts: i64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts,
            sustained_after: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gaps_strictly_increase() {
        let connector = Failing::default();
        let reconnect = ReconnectLoop::new(policy(4));
        let err = reconnect
            .run(&connector, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconnectError::MaxAttemptsReached { attempts: 4, .. }));

        let starts = connector.starts.lock();
        let gaps: Vec<_> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.windows(2).all(|w| w[1] > w[0]));
        assert!(gaps[0] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_is_exact() {
        let connector = Failing::default();
        let reconnect = ReconnectLoop::new(policy(2));
        let state = reconnect.state();
        assert!(reconnect.run(&connector, CancellationToken::new()).await.is_err());
        assert_eq!(connector.starts.lock().len(), 2);
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_session_resets_attempts() {
        /// Fails three times, holds one 10s session, then fails for good
        #[derive(Default)]
        struct Sustained {
            starts: Mutex<Vec<TokioInstant>>,
        }

        #[async_trait]
        impl Connect for Sustained {
            async fn attempt(
                &self,
                ctx: &AttemptContext,
                _cancel: &CancellationToken,
            ) -> Result<(), TunnelError> {
                let call = {
                    let mut starts = self.starts.lock();
                    starts.push(TokioInstant::now());
                    starts.len()
                };
                if call == 4 {
                    ctx.connected();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    return Ok(());
                }
                Err(TunnelError::Connect("refused".into()))
            }
        }

        let connector = Sustained::default();
        let reconnect = ReconnectLoop::new(policy(4));
        let err = reconnect
            .run(&connector, CancellationToken::new())
            .await
            .unwrap_err();

        // Three failures, the sustained session, then a fresh budget of four
        let starts = connector.starts.lock();
        assert_eq!(starts.len(), 8);
        assert!(matches!(err, ReconnectError::MaxAttemptsReached { attempts: 4, .. }));

        let gaps: Vec<_> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        let near = |gap: Duration, expected: Duration| {
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(5),
                "gap {:?}, expected {:?}",
                gap,
                expected
            );
        };
        let initial = Duration::from_millis(100);
        near(gaps[0], initial);
        near(gaps[2], Duration::from_millis(400));
        // The session lasted 10s, and the backoff after it starts over
        near(gaps[3], Duration::from_secs(10) + initial);
        near(gaps[4], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_cuts_backoff_short() {
        let connector = Arc::new(Failing::default());
        let reconnect = Arc::new(ReconnectLoop::new(ReconnectPolicy {
            initial_backoff: Duration::from_secs(60),
            ..policy(2)
        }));
        let waker = reconnect.waker();

        let started = TokioInstant::now();
        let task = {
            let reconnect = reconnect.clone();
            let connector = connector.clone();
            tokio::spawn(async move { reconnect.run(&connector, CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        waker.notify_one();
        assert!(task.await.unwrap().is_err());
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(connector.starts.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_cleanly() {
        let connector = Failing::default();
        let reconnect = ReconnectLoop::new(policy(-1));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                cancel.cancel();
            }
        };
        let (result, ()) = tokio::join!(reconnect.run(&connector, cancel), canceller);
        result.unwrap();
        assert!(connector.starts.lock().len() > 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hangup_wakes_backoff() {
        let reconnect = ReconnectLoop::new(policy(-1));
        let waker = reconnect.waker();
        let task = wake_on_hangup(waker.clone()).unwrap();

        let status = std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), waker.notified())
            .await
            .expect("hangup should wake the loop");
        task.abort();
    }
}
