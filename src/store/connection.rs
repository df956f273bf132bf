//! Connection state machine for networked drivers.
//!
//! ```text
//!   Connecting ──ok──▶ Ready ──lost──▶ Degraded ──ok──▶ Ready
//!       │                                 │
//!       └──fail──▶ Degraded ──5th fail──▶ Failed (terminal)
//! ```
//!
//! Attempts are retried at a fixed interval. After `max_attempts` consecutive
//! failures the monitor enters [`ConnectionState::Failed`] and no further attempt
//! is made; owners observe this through [`ConnectionMonitor::failed`] or a
//! [`watch`] subscription. Every state except `Ready` reports degraded.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in flight.
    Connecting,
    /// Connected and serving commands.
    Ready,
    /// Reconnecting after one or more failures.
    Degraded,
    /// Gave up; the driver will not recover.
    Failed,
}

impl ConnectionState {
    pub fn is_degraded(self) -> bool {
        self != ConnectionState::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

/// Publishes the connection state of one driver.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Resolves once the state reaches [`ConnectionState::Failed`].
    pub async fn failed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == ConnectionState::Failed).await;
    }

    /// Move to `next`. `Failed` is terminal and ignores every later transition.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Failed {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Ready → Degraded. Returns `true` if this call made the transition, so only
    /// one caller starts a reconnect cycle.
    pub(crate) fn mark_lost(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state != ConnectionState::Ready {
                return false;
            }
            *state = ConnectionState::Degraded;
            true
        })
    }
}

/// Run `connect` until it succeeds or the retry budget is spent.
///
/// Publishes `Ready` on success, `Degraded` between attempts and `Failed` once
/// `policy.max_attempts` consecutive attempts have failed.
///
/// # Errors
///
/// Returns [`StoreError::ConnectionFailed`] when the budget is exhausted.
pub async fn establish<C, E, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    monitor: &ConnectionMonitor,
    mut connect: F,
) -> StoreResult<C>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C, E>>,
    E: fmt::Display,
{
    let mut failures = 0u32;

    loop {
        match connect().await {
            Ok(connection) => {
                monitor.transition(ConnectionState::Ready);
                info!(store = name, "connection ready");
                return Ok(connection);
            }
            Err(e) => {
                failures += 1;
                warn!(store = name, attempt = failures, error = %e, "connection attempt failed");

                if failures >= policy.max_attempts {
                    monitor.transition(ConnectionState::Failed);
                    error!(store = name, attempts = failures, "giving up on connection");
                    return Err(StoreError::ConnectionFailed { attempts: failures });
                }

                monitor.transition(ConnectionState::Degraded);
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(fail_first: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u8, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let connect = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n > fail_first {
                Ok(7u8)
            } else {
                Err(format!("refused #{n}"))
            })
        };
        (calls, connect)
    }

    #[test]
    fn only_ready_is_healthy() {
        assert!(ConnectionState::Connecting.is_degraded());
        assert!(!ConnectionState::Ready.is_degraded());
        assert!(ConnectionState::Degraded.is_degraded());
        assert!(ConnectionState::Failed.is_degraded());
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(1_000));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn failed_is_terminal() {
        let monitor = ConnectionMonitor::new();
        assert!(monitor.transition(ConnectionState::Failed));
        assert!(!monitor.transition(ConnectionState::Ready));
        assert!(!monitor.mark_lost());
        assert_eq!(monitor.state(), ConnectionState::Failed);
    }

    #[test]
    fn only_ready_can_be_lost() {
        let monitor = ConnectionMonitor::new();
        assert!(!monitor.mark_lost());
        monitor.transition(ConnectionState::Ready);
        assert!(monitor.mark_lost());
        assert!(!monitor.mark_lost());
        assert_eq!(monitor.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_first_time() {
        let monitor = ConnectionMonitor::new();
        let (calls, connect) = flaky(0);
        let conn = establish("test", RetryPolicy::default(), &monitor, connect).await;
        assert_eq!(conn.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_at_fixed_interval() {
        let monitor = ConnectionMonitor::new();
        let (calls, connect) = flaky(3);
        let started = tokio::time::Instant::now();

        let conn = establish("test", RetryPolicy::default(), &monitor, connect).await;

        assert_eq!(conn.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
        assert_eq!(monitor.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_failures() {
        let monitor = ConnectionMonitor::new();
        let (calls, connect) = flaky(u32::MAX);

        let result = establish("test", RetryPolicy::default(), &monitor, connect).await;

        assert!(matches!(result, Err(StoreError::ConnectionFailed { attempts: 5 })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(monitor.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_is_observable_while_retrying() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        let (_, connect) = flaky(u32::MAX);

        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                establish("test", RetryPolicy::default(), &monitor, connect).await
            })
        };

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Degraded);

        monitor.failed().await;
        assert!(task.await.unwrap().is_err());
    }
}
