//! Persistent TCP client.
//!
//! One connection at a time, two I/O tasks per connection:
//!
//! ```text
//!            ┌──────────────┐  decoded packets  ┌────────────┐
//! socket ───►│  read loop   │──────────────────►│ subscriber │
//!            └──────────────┘   (Frame events)  └────────────┘
//!            ┌──────────────┐
//! send() ───►│ bounded queue│───► write loop ───► socket
//!            └──────────────┘
//! ```
//!
//! Both loops watch a per-connection shutdown signal; either loop's I/O
//! error tears the connection down, and the reconnector (holding only a
//! weak reference back into the client) re-dials with exponential backoff.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::heartbeat::{Heartbeat, HeartbeatConfig};
use super::reconnect::{ReconnectConfig, Reconnector};
use super::{ConnState, TransportEvent};
use crate::error::{FlowPacketError, Result};
use crate::frame::{self, Packet, SharedFraming};

/// Capacity of the outbound frame queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// TCP client handle. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<Inner>,
}

struct Inner {
    framing: SharedFraming,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<ConnState>,
    addr: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    reconnect_cfg: Mutex<ReconnectConfig>,
    heartbeat_cfg: Mutex<HeartbeatConfig>,
    connect_timeout: Mutex<Option<Duration>>,
    reconnector: Mutex<Option<Arc<Reconnector>>>,
    heartbeat: Mutex<Option<Arc<Heartbeat>>>,
}

/// Per-connection handles, replaced wholesale on every connect.
struct Session {
    sender: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl TcpClient {
    /// Create a client that frames traffic under `framing` and publishes
    /// [`TransportEvent`]s to `events`.
    pub fn new(framing: SharedFraming, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                framing,
                events,
                state: Mutex::new(ConnState::Disconnected),
                addr: Mutex::new(None),
                session: Mutex::new(None),
                reconnect_cfg: Mutex::new(ReconnectConfig::default()),
                heartbeat_cfg: Mutex::new(HeartbeatConfig::default()),
                connect_timeout: Mutex::new(None),
                reconnector: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Replace the reconnection policy for future disconnects.
    pub fn set_reconnect_config(&self, cfg: ReconnectConfig) {
        *self.inner.reconnect_cfg.lock() = cfg;
    }

    /// Replace the keepalive policy for future connects.
    pub fn set_heartbeat_config(&self, cfg: HeartbeatConfig) {
        *self.inner.heartbeat_cfg.lock() = cfg;
    }

    /// Bound the dial time of future connects.
    pub fn set_connect_timeout(&self, timeout: Option<Duration>) {
        *self.inner.connect_timeout.lock() = timeout;
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.inner.state.lock()
    }

    /// The framing configuration shared with this client.
    pub fn framing(&self) -> SharedFraming {
        self.inner.framing.clone()
    }

    /// Dial `addr` (`host:port`). No-op when already connected.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        Inner::connect(&self.inner, addr).await
    }

    /// Stop reconnection and close the connection. Idempotent.
    pub fn disconnect(&self) {
        if let Some(reconnector) = self.inner.reconnector.lock().take() {
            reconnector.stop();
        }
        {
            let mut state = self.inner.state.lock();
            if *state == ConnState::Disconnected {
                return;
            }
            *state = ConnState::Disconnected;
        }
        if let Some(session) = self.inner.session.lock().take() {
            let _ = session.shutdown.send(true);
        }
        if let Some(hb) = self.inner.heartbeat.lock().take() {
            hb.stop();
        }
    }

    /// Enqueue a pre-framed buffer, suspending while the queue is full.
    ///
    /// Fails with [`FlowPacketError::Closed`] when not connected. Enqueue
    /// order is preserved to the wire for a single sender.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let sender = self.outbound()?;
        sender.send(data).await.map_err(|_| FlowPacketError::Closed)
    }

    /// Non-blocking [`send`](Self::send); fails fast with
    /// [`FlowPacketError::Backpressure`] when the queue is full.
    pub fn try_send(&self, data: Bytes) -> Result<()> {
        let sender = self.outbound()?;
        sender.try_send(data).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => FlowPacketError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => FlowPacketError::Closed,
        })
    }

    fn outbound(&self) -> Result<mpsc::Sender<Bytes>> {
        if *self.inner.state.lock() != ConnState::Connected {
            return Err(FlowPacketError::Closed);
        }
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.sender.clone())
            .ok_or(FlowPacketError::Closed)
    }
}

impl Inner {
    async fn connect(this: &Arc<Inner>, addr: &str) -> Result<()> {
        {
            let mut state = this.state.lock();
            if *state == ConnState::Connected {
                return Ok(());
            }
            *state = ConnState::Connecting;
        }

        let dial_timeout = *this.connect_timeout.lock();
        let dial = TcpStream::connect(addr);
        let result = match dial_timeout {
            Some(t) => match tokio::time::timeout(t, dial).await {
                Ok(res) => res,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            },
            None => dial.await,
        };

        let stream = match result.and_then(|s| s.peer_addr().map(|peer| (s, peer))) {
            Ok(pair) => pair,
            Err(err) => {
                *this.state.lock() = ConnState::Disconnected;
                return Err(err.into());
            }
        };
        let (stream, peer) = stream;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut state = this.state.lock();
            *state = ConnState::Connected;
            // the previous session's queue (and any stale frames) drops here
            *this.session.lock() = Some(Session {
                sender: tx.clone(),
                shutdown: shutdown_tx,
            });
            *this.addr.lock() = Some(addr.to_string());
        }

        let _ = this.events.send(TransportEvent::Connected { peer });

        tokio::spawn(read_loop(
            read_half,
            this.framing.clone(),
            this.events.clone(),
            Arc::downgrade(this),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_loop(write_half, rx, Arc::downgrade(this), shutdown_rx));

        Inner::start_heartbeat(this, tx);

        Ok(())
    }

    fn start_heartbeat(this: &Arc<Inner>, sender: mpsc::Sender<Bytes>) {
        let cfg = this.heartbeat_cfg.lock().clone();
        if !cfg.enabled {
            return;
        }

        // the keepalive frame is encoded once, under the snapshot current
        // at start
        let snapshot = this.framing.snapshot();
        let frame = match frame::encode(&Packet::heartbeat(0), &snapshot) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "heartbeat frame encode failed");
                return;
            }
        };

        let hb = Arc::new(Heartbeat::new(cfg));
        *this.heartbeat.lock() = Some(hb.clone());
        let weak = Arc::downgrade(this);
        hb.start(
            move || {
                sender
                    .try_send(frame.clone())
                    .map_err(|err| match err {
                        mpsc::error::TrySendError::Full(_) => FlowPacketError::Backpressure,
                        mpsc::error::TrySendError::Closed(_) => FlowPacketError::Closed,
                    })
            },
            move || {
                if let Some(inner) = weak.upgrade() {
                    Inner::handle_disconnect(&inner, "heartbeat timeout".to_string());
                }
            },
        );
    }

    /// Tear the connection down after an I/O failure and, when enabled,
    /// hand over to the reconnector.
    fn handle_disconnect(this: &Arc<Inner>, error: String) {
        let addr = {
            let mut state = this.state.lock();
            if *state == ConnState::Disconnected {
                return;
            }
            *state = ConnState::Disconnected;
            if let Some(session) = this.session.lock().take() {
                let _ = session.shutdown.send(true);
            }
            this.addr.lock().clone()
        };
        if let Some(hb) = this.heartbeat.lock().take() {
            hb.stop();
        }

        tracing::debug!(error = %error, "connection lost");
        let _ = this.events.send(TransportEvent::Disconnected { error });

        let cfg = this.reconnect_cfg.lock().clone();
        let Some(addr) = addr else { return };
        if !cfg.enabled {
            return;
        }

        *this.state.lock() = ConnState::Reconnecting;
        let reconnector = Arc::new(Reconnector::new(cfg));
        *this.reconnector.lock() = Some(reconnector.clone());

        let connect_ref = Arc::downgrade(this);
        let give_up_ref = Arc::downgrade(this);
        let events = this.events.clone();
        reconnector.spawn(
            move || {
                let weak = connect_ref.clone();
                let addr = addr.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => Inner::connect(&inner, &addr).await,
                        None => Err(FlowPacketError::Closed),
                    }
                }
            },
            || {},
            move |retries| {
                if let Some(inner) = give_up_ref.upgrade() {
                    *inner.state.lock() = ConnState::Disconnected;
                }
                let _ = events.send(TransportEvent::ReconnectGaveUp { retries });
            },
        );
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    framing: SharedFraming,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // one snapshot per frame, so a config swap applies from the next
        // frame boundary
        let cfg = framing.snapshot();
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            res = frame::read_packet(&mut reader, &cfg) => res,
        };

        match result {
            Ok(Some(pkt)) => {
                if let Some(inner) = inner.upgrade() {
                    if let Some(hb) = inner.heartbeat.lock().as_ref() {
                        hb.feed();
                    }
                }
                let _ = events.send(TransportEvent::Frame(pkt));
            }
            Ok(None) => {
                if let Some(inner) = inner.upgrade() {
                    Inner::handle_disconnect(&inner, "connection closed by peer".to_string());
                }
                return;
            }
            Err(err) => {
                if let Some(inner) = inner.upgrade() {
                    Inner::handle_disconnect(&inner, err.to_string());
                }
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    inner: Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        if let Err(err) = write_frame(&mut writer, &frame).await {
            if let Some(inner) = inner.upgrade() {
                Inner::handle_disconnect(&inner, err.to_string());
            }
            return;
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
