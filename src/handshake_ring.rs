//! Bounded, lossy queue of inbound handshake messages awaiting pickup by
//! the control endpoint.
//!
//! Backed by a bounded `tokio::sync::mpsc` channel, which already
//! serializes its producers and consumer; a `Notify` gives readers a way
//! to wait for "ring became non-empty" without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::endpoint::FlatEndpoint;

/// Default capacity, matching `FASTD_MSG_BUFFER_SIZE` in the wire spec.
pub const DEFAULT_RING_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub src: FlatEndpoint,
    pub dst: FlatEndpoint,
    /// The opaque handshake payload; its first byte is always `0x01`.
    pub data: Vec<u8>,
}

impl HandshakeMessage {
    pub fn datalen(&self) -> u16 {
        self.data.len() as u16
    }
}

#[derive(Default)]
pub struct RingCounters {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct HandshakeRing {
    tx: mpsc::Sender<HandshakeMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<HandshakeMessage>>,
    readable: Notify,
    counters: Arc<RingCounters>,
}

impl HandshakeRing {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            readable: Notify::new(),
            counters: Arc::new(RingCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<RingCounters> {
        self.counters.clone()
    }

    /// Non-blocking enqueue. Drops and logs on overflow; never blocks the
    /// caller, matching the "no backpressure" policy for the packet path.
    pub fn try_enqueue(&self, msg: HandshakeMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.readable.notify_one();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("handshake ring full, dropping inbound handshake");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("handshake ring closed, dropping inbound handshake");
            }
        }
    }

    /// Dequeue one message, or `None` if the ring is empty right now.
    pub async fn try_dequeue(&self) -> Option<HandshakeMessage> {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(msg) => {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(msg)
            }
            Err(_) => None,
        }
    }

    /// Resolves once the ring has at least one message enqueued since this
    /// call started waiting. Spurious wakeups are possible; callers should
    /// loop on `try_dequeue`.
    pub async fn readable(&self) {
        self.readable.notified().await;
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (
            self.counters.enqueued.load(Ordering::Relaxed),
            self.counters.dequeued.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, FLAT_ENDPOINT_LEN};

    fn flat(port: u16) -> FlatEndpoint {
        let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        Endpoint::new(addr).to_flat()
    }

    #[tokio::test]
    async fn enqueue_dequeue_round_trip() {
        let ring = HandshakeRing::new(4);
        ring.try_enqueue(HandshakeMessage {
            src: flat(1),
            dst: flat(2),
            data: vec![0x01, 0xaa],
        });
        let msg = ring.try_dequeue().await.expect("message present");
        assert_eq!(msg.data, vec![0x01, 0xaa]);
        assert_eq!(msg.src.len(), FLAT_ENDPOINT_LEN);
        let (enq, deq, drop) = ring.counts();
        assert_eq!((enq, deq, drop), (1, 1, 0));
    }

    #[tokio::test]
    async fn overflow_drops_without_panicking() {
        let ring = HandshakeRing::new(2);
        for i in 0..5u8 {
            ring.try_enqueue(HandshakeMessage {
                src: flat(1),
                dst: flat(2),
                data: vec![0x01, i],
            });
        }
        let (_, _, dropped) = ring.counts();
        assert!(dropped >= 3);
        // draining still works afterward
        let mut drained = 0;
        while ring.try_dequeue().await.is_some() {
            drained += 1;
        }
        assert!(drained > 0);
    }
}
