//! Sequence allocation and request/response correlation.
//!
//! Every outbound request takes a fresh sequence number and registers a
//! single-use reply slot; the receive path deposits reply bytes by seq, or
//! into the oldest waiter when the server echoes no seq back.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use flowpacket::correlate::Correlator;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let correlator = Correlator::new();
//! let (seq, slot) = correlator.next_seq();
//! assert!(correlator.resolve(seq, Bytes::from_static(b"reply")));
//! let data = slot.wait(std::time::Duration::from_secs(1)).await.unwrap();
//! assert_eq!(&data[..], b"reply");
//! # });
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{FlowPacketError, Result};

/// Monotonic sequence counter plus the pending-reply table.
///
/// The table is ordered by seq so the no-seq fallback deterministically
/// picks the oldest outstanding request.
pub struct Correlator {
    inner: Mutex<Inner>,
}

struct Inner {
    counter: u32,
    pending: BTreeMap<u32, oneshot::Sender<Bytes>>,
}

/// Single-use receiving end of a pending request.
pub struct ReplySlot {
    rx: oneshot::Receiver<Bytes>,
}

impl Correlator {
    /// Create an empty correlator. The first allocated seq is 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                counter: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Allocate the next seq and register its reply slot.
    pub fn next_seq(&self) -> (u32, ReplySlot) {
        let mut inner = self.inner.lock();
        inner.counter = inner.counter.wrapping_add(1);
        let seq = inner.counter;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(seq, tx);
        (seq, ReplySlot { rx })
    }

    /// Deposit `data` into the slot registered for `seq`.
    ///
    /// Returns `false` when no such entry is pending. A matched entry is
    /// removed, so each seq is delivered at most once.
    pub fn resolve(&self, seq: u32, data: Bytes) -> bool {
        let tx = self.inner.lock().pending.remove(&seq);
        match tx {
            Some(tx) => {
                // a timed-out waiter may have dropped its receiver already
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    /// Deposit `data` into the oldest pending slot (smallest seq).
    ///
    /// Fallback for servers that reply without echoing the seq field.
    pub fn resolve_first(&self, data: Bytes) -> bool {
        let entry = self.inner.lock().pending.pop_first();
        match entry {
            Some((_, tx)) => {
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    /// Zero the counter and drop every pending entry, waking blocked
    /// waiters with a cancellation.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.counter = 0;
        inner.pending.clear();
    }

    /// Number of outstanding entries.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplySlot {
    /// Block for the reply for at most `timeout`.
    ///
    /// A timeout does not remove the table entry; orphaned entries are
    /// collected by [`Correlator::reset`]. Returns
    /// [`FlowPacketError::Cancelled`] when the slot was closed by a reset.
    pub async fn wait(self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(FlowPacketError::Cancelled),
            Err(_) => Err(FlowPacketError::Timeout),
        }
    }
}
