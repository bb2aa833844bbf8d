//! Bound UDP sockets: one kernel listener per local endpoint, plus the
//! peers that send and receive through it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::error::{CoreError, CoreResult};
use crate::peer::Peer;

/// A listener bound to one local endpoint. Owns the kernel socket and the
/// list of peers that currently use it for outbound sends.
pub struct BoundSocket {
    local: Endpoint,
    socket: Arc<UdpSocket>,
    peers: Mutex<Vec<Weak<Peer>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BoundSocket {
    /// Binds a UDP socket at `local`. Deliberately does *not* set
    /// `SO_REUSEADDR`: UDP sockets have no TCP-style TIME_WAIT to race, and
    /// on Linux `SO_REUSEADDR` lets a second socket bind the exact same
    /// address:port (packets are then split between them), which would
    /// quietly violate invariant 1 (at most one bound socket per local
    /// endpoint) and mask a genuine bind conflict as success.
    pub async fn bind(local: Endpoint) -> CoreResult<Arc<Self>> {
        if local.is_unspecified() && local.port() == 0 {
            return Err(CoreError::AddressNotAvailable);
        }

        let domain = if local.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let sock2 = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        sock2.set_nonblocking(true)?;
        sock2.bind(&local.addr().into())?;
        let std_socket: std::net::UdpSocket = sock2.into();
        let socket = UdpSocket::from_std(std_socket)?;

        // Re-read the address the kernel actually assigned: with an
        // ephemeral port (`:0`) the caller's endpoint is only a request,
        // and storing anything else here would break `find`/`close`'s
        // exact-match lookup and invariant 6's round-trip guarantee.
        let local = match socket.local_addr() {
            Ok(addr) => Endpoint::new(addr),
            Err(_) => local,
        };

        Ok(Arc::new(Self {
            local,
            socket: Arc::new(socket),
            peers: Mutex::new(Vec::new()),
            recv_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn local(&self) -> Endpoint {
        self.local
    }

    pub fn raw(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> CoreResult<usize> {
        Ok(self.socket.send_to(buf, dst).await?)
    }

    pub(crate) async fn set_recv_task(&self, task: JoinHandle<()>) {
        *self.recv_task.lock().await = Some(task);
    }

    pub async fn add_peer_ref(&self, peer: &Arc<Peer>) {
        self.peers.lock().await.push(Arc::downgrade(peer));
    }

    pub async fn remove_peer_ref(&self, peer_id: u32) {
        self.peers.lock().await.retain(|w| match w.upgrade() {
            Some(p) => p.id != peer_id,
            None => false,
        });
    }

    /// Returns every currently-live peer attached to this socket, dropping
    /// dead weak references along the way. Used when closing a socket so
    /// the caller can detach/teardown each one.
    pub async fn live_peers(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.lock().await;
        let live: Vec<Arc<Peer>> = peers.iter().filter_map(Weak::upgrade).collect();
        peers.retain(|w| w.upgrade().is_some());
        live
    }

    /// Aborts the receive task. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Plain (unlocked) collection of bound sockets, intended to live behind
/// the module's single global lock rather than own one itself.
#[derive(Default)]
pub struct SocketTable {
    sockets: Vec<Arc<BoundSocket>>,
}

impl SocketTable {
    pub fn insert(&mut self, socket: Arc<BoundSocket>) {
        self.sockets.push(socket);
    }

    pub fn remove(&mut self, local: &Endpoint) -> Option<Arc<BoundSocket>> {
        let idx = self.sockets.iter().position(|s| s.local().equal(local))?;
        Some(self.sockets.remove(idx))
    }

    pub fn find(&self, local: &Endpoint) -> Option<Arc<BoundSocket>> {
        self.sockets.iter().find(|s| s.local().equal(local)).cloned()
    }

    pub fn find_by_family(&self, ipv4: bool) -> Option<Arc<BoundSocket>> {
        self.sockets.iter().find(|s| s.local().is_ipv4() == ipv4).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BoundSocket>> {
        self.sockets.iter()
    }

    pub fn drain(&mut self) -> Vec<Arc<BoundSocket>> {
        std::mem::take(&mut self.sockets)
    }
}
