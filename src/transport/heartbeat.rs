//! Keepalive ticker with a receive watchdog.
//!
//! Every `interval` the ticker invokes the send hook (a pre-framed
//! heartbeat) and then checks how long the peer has been silent. The owner
//! calls [`Heartbeat::feed`] on any inbound traffic; silence beyond
//! `timeout` fires the timeout hook exactly once and stops the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Keepalive policy.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Heartbeat send interval.
    pub interval: Duration,
    /// Peer-silence budget before the watchdog fires.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
        }
    }
}

/// Keepalive task handle.
pub struct Heartbeat {
    cfg: HeartbeatConfig,
    last_received: Mutex<Instant>,
    stop_tx: watch::Sender<bool>,
    running: Mutex<bool>,
}

impl Heartbeat {
    pub fn new(cfg: HeartbeatConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cfg,
            last_received: Mutex::new(Instant::now()),
            stop_tx,
            running: Mutex::new(false),
        }
    }

    /// Start the ticker. No-op when disabled or already running.
    pub fn start<S, T>(self: Arc<Self>, send: S, on_timeout: T)
    where
        S: Fn() -> crate::error::Result<()> + Send + Sync + 'static,
        T: FnOnce() + Send + 'static,
    {
        if !self.cfg.enabled {
            return;
        }
        {
            let mut running = self.running.lock();
            if *running {
                return;
            }
            *running = true;
        }
        *self.last_received.lock() = Instant::now();
        let _ = self.stop_tx.send(false);

        tokio::spawn(async move {
            self.run(send, on_timeout).await;
        });
    }

    async fn run<S, T>(self: Arc<Self>, send: S, on_timeout: T)
    where
        S: Fn() -> crate::error::Result<()> + Send + Sync + 'static,
        T: FnOnce() + Send + 'static,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.cfg.interval) => {
                    if let Err(err) = send() {
                        tracing::debug!(error = %err, "heartbeat send failed");
                    }

                    let silence = self.last_received.lock().elapsed();
                    if silence > self.cfg.timeout {
                        tracing::warn!(?silence, "heartbeat watchdog fired");
                        *self.running.lock() = false;
                        on_timeout();
                        return;
                    }
                }
            }
        }
    }

    /// Record inbound traffic, postponing the watchdog.
    pub fn feed(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Stop the ticker. Idempotent; after a stop no timeout can fire.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        if !*running {
            return;
        }
        *running = false;
        let _ = self.stop_tx.send(true);
    }

    /// Whether the ticker task is active.
    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_cfg() -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: true,
            interval: Duration::from_millis(30),
            timeout: Duration::from_millis(80),
        }
    }

    #[tokio::test]
    async fn test_watchdog_fires_without_feed() {
        let hb = Arc::new(Heartbeat::new(fast_cfg()));
        let sends = Arc::new(AtomicU32::new(0));
        let (timeout_tx, timeout_rx) = tokio::sync::oneshot::channel();

        let counter = sends.clone();
        hb.clone().start(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                let _ = timeout_tx.send(());
            },
        );

        tokio::time::timeout(Duration::from_millis(200), timeout_rx)
            .await
            .expect("watchdog did not fire")
            .unwrap();

        assert!(!hb.is_running());
        assert!(sends.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_feed_defers_watchdog() {
        let hb = Arc::new(Heartbeat::new(fast_cfg()));
        let fired = Arc::new(AtomicU32::new(0));

        let flag = fired.clone();
        hb.clone().start(
            || Ok(()),
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        );

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hb.feed();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(hb.is_running());
        hb.stop();
    }

    #[tokio::test]
    async fn test_stop_prevents_timeout() {
        let hb = Arc::new(Heartbeat::new(fast_cfg()));
        let fired = Arc::new(AtomicU32::new(0));

        let flag = fired.clone();
        hb.clone().start(
            || Ok(()),
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        );

        hb.stop();
        hb.stop(); // idempotent

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!hb.is_running());
    }

    #[tokio::test]
    async fn test_disabled_does_not_start() {
        let hb = Arc::new(Heartbeat::new(HeartbeatConfig {
            enabled: false,
            ..fast_cfg()
        }));
        hb.clone().start(|| Ok(()), || panic!("must not fire"));
        assert!(!hb.is_running());
    }
}
