//! Exponential-backoff reconnection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether lost connections are re-dialed at all.
    pub enabled: bool,
    /// Wait before the first attempt.
    pub initial_wait: Duration,
    /// Upper bound for the backoff wait.
    pub max_wait: Duration,
    /// Attempt budget; 0 means unbounded.
    pub max_retries: u32,
    /// Backoff growth factor.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            max_retries: 10,
            multiplier: 2.0,
        }
    }
}

/// Drives repeated connect attempts with exponential backoff.
///
/// Each attempt sleeps `backoff_duration(n)` and then calls the connect
/// closure. The loop ends on the first success, on [`stop`](Self::stop)
/// (promptly, even mid-sleep, without invoking any callback), or when the
/// retry budget runs out.
pub struct Reconnector {
    cfg: ReconnectConfig,
    stop_tx: watch::Sender<bool>,
}

impl Reconnector {
    pub fn new(cfg: ReconnectConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { cfg, stop_tx }
    }

    /// Backoff wait for retry `n` (counted from 0):
    /// `min(initial_wait * multiplier^n, max_wait)`.
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        let wait = self.cfg.initial_wait.as_secs_f64() * self.cfg.multiplier.powi(retry as i32);
        Duration::from_secs_f64(wait.min(self.cfg.max_wait.as_secs_f64()))
    }

    /// Cancel the retry loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Spawn the retry loop.
    ///
    /// `on_success` runs after a successful connect; `on_give_up` runs with
    /// the attempt count when the budget is exhausted.
    pub fn spawn<C, Fut, S, G>(self: Arc<Self>, connect: C, on_success: S, on_give_up: G)
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send,
        S: FnOnce() + Send + 'static,
        G: FnOnce(u32) + Send + 'static,
    {
        if !self.cfg.enabled || *self.stop_tx.borrow() {
            return;
        }
        tokio::spawn(async move {
            self.run(connect, on_success, on_give_up).await;
        });
    }

    async fn run<C, Fut, S, G>(self: Arc<Self>, connect: C, on_success: S, on_give_up: G)
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::error::Result<()>> + Send,
        S: FnOnce() + Send + 'static,
        G: FnOnce(u32) + Send + 'static,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut retries: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                return;
            }
            if self.cfg.max_retries > 0 && retries >= self.cfg.max_retries {
                on_give_up(retries);
                return;
            }

            let wait = self.backoff_duration(retries);
            retries += 1;

            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if *stop_rx.borrow() {
                return;
            }

            match connect().await {
                Ok(()) => {
                    on_success();
                    return;
                }
                Err(err) => {
                    tracing::debug!(attempt = retries, error = %err, "reconnect attempt failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowPacketError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_cfg(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(4),
            max_retries,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let r = Reconnector::new(ReconnectConfig::default());
        let expected = [1, 2, 4, 8, 16, 30, 30, 30, 30, 30];
        for (n, secs) in expected.iter().enumerate() {
            assert_eq!(
                r.backoff_duration(n as u32),
                Duration::from_secs(*secs),
                "retry {n}"
            );
        }
    }

    #[test]
    fn test_backoff_respects_multiplier() {
        let r = Reconnector::new(ReconnectConfig {
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(1),
            multiplier: 3.0,
            ..ReconnectConfig::default()
        });
        assert_eq!(r.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(r.backoff_duration(1), Duration::from_millis(300));
        assert_eq!(r.backoff_duration(2), Duration::from_millis(900));
        assert_eq!(r.backoff_duration(3), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let r = Arc::new(Reconnector::new(fast_cfg(0)));
        let attempts = Arc::new(AtomicU32::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let counter = attempts.clone();
        r.clone().spawn(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FlowPacketError::Closed)
                    } else {
                        Ok(())
                    }
                }
            },
            move || {
                let _ = done_tx.send(());
            },
            |_| panic!("must not give up"),
        );

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("reconnect did not succeed in time")
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let r = Arc::new(Reconnector::new(fast_cfg(3)));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        r.clone().spawn(
            || async { Err(FlowPacketError::Closed) },
            || panic!("must not succeed"),
            move |retries| {
                let _ = done_tx.send(retries);
            },
        );

        let retries = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("give-up did not fire")
            .unwrap();
        assert_eq!(retries, 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_sleep_without_callbacks() {
        let r = Arc::new(Reconnector::new(ReconnectConfig {
            initial_wait: Duration::from_secs(60),
            ..ReconnectConfig::default()
        }));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        r.clone().spawn(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            || panic!("must not succeed"),
            |_| panic!("must not give up"),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        r.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_never_spawns() {
        let r = Arc::new(Reconnector::new(ReconnectConfig {
            enabled: false,
            initial_wait: Duration::from_millis(1),
            ..ReconnectConfig::default()
        }));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        r.clone().spawn(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            || {},
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
