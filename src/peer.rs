//! Peer (tunnel interface) lifecycle: reference counting, teardown, and
//! the acquire/release protocol that lets an in-flight packet keep a peer
//! alive past a concurrent teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::device::TunDevice;
use crate::endpoint::Endpoint;
use crate::error::{CoreError, CoreResult};
use crate::socket_table::BoundSocket;

pub const INTERFACE_PREFIX: &str = "fastd";
pub const DEFAULT_MTU: u16 = 1406;

#[derive(Debug, Default)]
pub struct PeerCounters {
    pub ipackets: AtomicU64,
    pub ibytes: AtomicU64,
    pub ierrors: AtomicU64,
    pub opackets: AtomicU64,
    pub obytes: AtomicU64,
    pub oerrors: AtomicU64,
}

/// `NEW -> ACTIVE <-> RECONFIGURING -> TORNDOWN -> DESTROYED`. `DESTROYED`
/// is not a stored state: once `destroy()` completes the peer is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Active,
    Reconfiguring,
    Torndown,
}

/// Mutable per-peer state, guarded by one read-mostly lock as the
/// concurrency model calls for. Everything that changes on `add_peer`,
/// `set_remote`, or `teardown` lives here.
struct Inner {
    state: PeerState,
    remote: Option<Endpoint>,
    pubkey: [u8; 32],
    socket: Option<Weak<BoundSocket>>,
    device: Option<Arc<TunDevice>>,
}

/// A point-to-point tunnel interface bound to (at most) one remote
/// endpoint and one local socket.
pub struct Peer {
    pub id: u32,
    pub name: String,
    pub mtu: u16,
    inner: RwLock<Inner>,
    teardown: AtomicBool,
    refcount: AtomicUsize,
    refcount_zero: Notify,
    pub counters: PeerCounters,
    /// Handle to the `run_output_pump` task draining this peer's device.
    /// Aborted on teardown: the pump otherwise blocks inside the device's
    /// `recv()` and would never notice a cooperative "device detached"
    /// signal until another packet arrived to wake it.
    output_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(id: u32, pubkey: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: format!("{INTERFACE_PREFIX}{id}"),
            mtu: DEFAULT_MTU,
            inner: RwLock::new(Inner {
                state: PeerState::New,
                remote: None,
                pubkey,
                socket: None,
                device: None,
            }),
            teardown: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
            refcount_zero: Notify::new(),
            counters: PeerCounters::default(),
            output_task: Mutex::new(None),
        })
    }

    /// Records the handle of this peer's output pump task so teardown can
    /// abort it directly rather than relying on it to notice a device
    /// detach on its own.
    pub(crate) async fn set_output_task(&self, task: JoinHandle<()>) {
        *self.output_task.lock().await = Some(task);
    }

    async fn abort_output_task(&self) {
        if let Some(task) = self.output_task.lock().await.take() {
            task.abort();
        }
    }

    pub async fn remote(&self) -> Option<Endpoint> {
        self.inner.read().await.remote
    }

    pub async fn set_remote_endpoint(&self, remote: Endpoint) {
        self.inner.write().await.remote = Some(remote);
    }

    pub async fn clear_remote(&self) {
        self.inner.write().await.remote = None;
    }

    pub async fn pubkey(&self) -> [u8; 32] {
        self.inner.read().await.pubkey
    }

    pub async fn set_pubkey(&self, key: [u8; 32]) {
        self.inner.write().await.pubkey = key;
    }

    pub async fn state(&self) -> PeerState {
        self.inner.read().await.state
    }

    pub async fn set_state(&self, s: PeerState) {
        self.inner.write().await.state = s;
    }

    pub async fn socket(&self) -> Option<Arc<BoundSocket>> {
        self.inner.read().await.socket.as_ref().and_then(Weak::upgrade)
    }

    pub async fn attach_socket(&self, socket: &Arc<BoundSocket>) {
        self.inner.write().await.socket = Some(Arc::downgrade(socket));
    }

    pub async fn detach_socket(&self) {
        self.inner.write().await.socket = None;
    }

    pub async fn device(&self) -> Option<Arc<TunDevice>> {
        self.inner.read().await.device.clone()
    }

    pub async fn attach_device(&self, device: Arc<TunDevice>) {
        self.inner.write().await.device = Some(device);
    }

    /// Clears the attached device and aborts its output pump task. Without
    /// this, `run_output_pump` would stay parked inside the device's
    /// `recv()` forever once torn down (nothing wakes a cooperative check
    /// of `peer.device()` until another packet happens to arrive), holding
    /// this peer's `Arc` alive indefinitely.
    pub async fn detach_device(&self) {
        self.inner.write().await.device = None;
        self.abort_output_task().await;
    }

    pub fn is_torndown(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    pub fn mark_teardown(&self) {
        self.teardown.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        !self.is_torndown()
    }

    /// Takes a reference the destroyer must wait for. Returns an
    /// [`AcquiredPeer`] whose `Drop` releases it again.
    pub fn acquire(self: &Arc<Self>) -> AcquiredPeer {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        AcquiredPeer { peer: self.clone() }
    }

    fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.refcount_zero.notify_waiters();
        }
    }

    fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Waits for all outstanding acquisitions to be released. No deadline;
    /// re-checks on every notification and on a periodic tick so a missed
    /// wakeup cannot wedge teardown forever.
    pub async fn wait_for_quiescence(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
        loop {
            if self.refcount() == 0 {
                return;
            }
            tokio::select! {
                _ = self.refcount_zero.notified() => {}
                _ = ticker.tick() => {}
            }
        }
    }

    pub fn validate_remote(remote: &Endpoint) -> CoreResult<()> {
        if remote.is_unspecified() || remote.port() == 0 {
            return Err(CoreError::InvalidArgument(
                "remote endpoint must be specified with a non-zero port",
            ));
        }
        Ok(())
    }
}

/// A live reference to a peer. Holding one guarantees the peer will not be
/// freed (though it may already be in teardown — check [`Peer::is_torndown`]
/// before dispatching a packet).
pub struct AcquiredPeer {
    peer: Arc<Peer>,
}

impl std::ops::Deref for AcquiredPeer {
    type Target = Peer;
    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for AcquiredPeer {
    fn drop(&mut self) {
        self.peer.release();
    }
}

/// Parameters supplied at interface-clone time, or to `SET_REMOTE`.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub remote: Endpoint,
    pub pubkey: [u8; 32],
}
