//! The process-wide value owning every registry: bound sockets, the
//! peer/flow table, and the handshake ring. Construction wires them
//! together; teardown order is: stop accepting new peers, teardown every
//! peer, close every socket, drain the ring.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{CoreError, CoreResult};
use crate::handshake_ring::HandshakeRing;
use crate::peer::{Peer, PeerState, DEFAULT_MTU};
use crate::peer_table::PeerTable;
use crate::socket_table::{BoundSocket, SocketTable};

/// Everything protected by the single global read-mostly lock: the socket
/// table, the peer/flow table, and (via `PeerTable::all_peers`) the
/// global peer list.
pub(crate) struct ModuleState {
    pub sockets: SocketTable,
    pub peers: PeerTable,
}

pub struct Module {
    pub(crate) state: RwLock<ModuleState>,
    pub ring: HandshakeRing,
    pub config: Config,
    next_peer_id: AtomicU32,
}

impl Module {
    pub fn new(config: Config) -> Arc<Self> {
        let state = ModuleState {
            sockets: SocketTable::default(),
            peers: PeerTable::new(config.hash_size),
        };
        Arc::new(Self {
            state: RwLock::new(state),
            ring: HandshakeRing::new(config.ring_capacity),
            next_peer_id: AtomicU32::new(0),
            config,
        })
    }

    /// Binds a new listener and starts its classifier receive loop.
    pub async fn bind(self: &Arc<Self>, local: Endpoint) -> CoreResult<()> {
        let socket = BoundSocket::bind(local).await?;
        let task = {
            let socket = socket.clone();
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                crate::classifier::run(weak, socket).await;
            })
        };
        socket.set_recv_task(task).await;

        let mut state = self.state.write().await;
        state.sockets.insert(socket);
        tracing::info!(local = %local, "bound listener");
        Ok(())
    }

    /// Closes a listener by exact local-endpoint match, detaching and
    /// tearing down every peer that used it.
    pub async fn close(self: &Arc<Self>, local: Endpoint) -> CoreResult<()> {
        let (socket, peers) = {
            let mut state = self.state.write().await;
            let socket = state.sockets.remove(&local).ok_or(CoreError::NotFound)?;
            let peers = socket.live_peers().await;
            for peer in &peers {
                state.peers.remove_flow(peer.id);
            }
            (socket, peers)
        };
        socket.close().await;
        for peer in peers {
            self.teardown_peer(&peer).await;
            self.destroy_peer(&peer).await;
        }
        tracing::info!(local = %local, "closed listener");
        Ok(())
    }

    /// Creates a detached interface (no remote configured yet), optionally
    /// immediately wired up if `initial` is supplied.
    pub async fn clone_create(
        self: &Arc<Self>,
        pubkey: [u8; 32],
        initial: Option<(Endpoint, [u8; 32])>,
    ) -> CoreResult<Arc<Peer>> {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Peer::new(id, pubkey);
        {
            let mut state = self.state.write().await;
            state.peers.register(peer.clone());
        }
        tracing::info!(interface = %peer.name, "interface cloned");
        if let Some((remote, pubkey)) = initial {
            self.add_peer(&peer, remote, pubkey).await?;
        }
        Ok(peer)
    }

    /// Associates a remote endpoint with a peer, bringing its interface up
    /// with a real TUN device standing in for the host IP stack.
    pub async fn add_peer(self: &Arc<Self>, peer: &Arc<Peer>, remote: Endpoint, pubkey: [u8; 32]) -> CoreResult<()> {
        let device = crate::device::TunDevice::spawn(tun_config_for(&self.config, peer))
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        self.add_peer_with_device(peer, remote, pubkey, device).await
    }

    /// As [`Module::add_peer`], but takes the device instead of spawning a
    /// real TUN interface. Production callers always go through `add_peer`;
    /// this entry point exists so the datapath can be exercised end to end
    /// (decap delivering to "the host stack", encap picking up packets
    /// "from" it) without the root/NET_ADMIN privileges real TUN creation
    /// needs — see [`crate::device::TunDevice::test_pair`].
    pub async fn add_peer_with_device(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        remote: Endpoint,
        pubkey: [u8; 32],
        device: crate::device::TunDevice,
    ) -> CoreResult<()> {
        Peer::validate_remote(&remote)?;
        if peer.is_torndown() {
            return Err(CoreError::Busy);
        }

        let socket = {
            let mut state = self.state.write().await;
            if state.peers.remote_held_by_other(&remote, peer.id).is_some() {
                return Err(CoreError::Busy);
            }
            let socket = state
                .sockets
                .find_by_family(remote.is_ipv4())
                .ok_or(CoreError::AddressNotAvailable)?;
            state.peers.insert_flow(remote, peer.clone());
            socket
        };

        peer.set_remote_endpoint(remote).await;
        peer.set_pubkey(pubkey).await;
        peer.attach_socket(&socket).await;
        socket.add_peer_ref(peer).await;
        peer.set_state(PeerState::Active).await;

        peer.attach_device(Arc::new(device)).await;
        let pump = tokio::spawn(crate::encap::run_output_pump(peer.clone()));
        peer.set_output_task(pump).await;

        tracing::info!(interface = %peer.name, remote = %remote, "peer active");
        Ok(())
    }

    /// Rebinds a peer's remote. A request naming the peer's current
    /// remote is a no-op success; a request naming a remote already held
    /// by some other peer fails with `Busy`.
    pub async fn set_remote(self: &Arc<Self>, peer: &Arc<Peer>, remote: Endpoint, pubkey: [u8; 32]) -> CoreResult<()> {
        Peer::validate_remote(&remote)?;
        if peer.is_torndown() {
            return Err(CoreError::Busy);
        }

        if let Some(current) = peer.remote().await {
            if current.equal(&remote) {
                peer.set_pubkey(pubkey).await;
                return Ok(());
            }
        }

        {
            let mut state = self.state.write().await;
            if state.peers.remote_held_by_other(&remote, peer.id).is_some() {
                return Err(CoreError::Busy);
            }
            state.peers.remove_flow(peer.id);
            state.peers.insert_flow(remote, peer.clone());
        }

        peer.set_remote_endpoint(remote).await;
        peer.set_pubkey(pubkey).await;
        tracing::info!(interface = %peer.name, remote = %remote, "peer remote updated");
        Ok(())
    }

    /// Marks a peer for teardown: flips the flag, brings the interface
    /// down, and removes it from the flow hash and its socket's list so
    /// no new lookup can find it. Existing `AcquiredPeer` holders finish
    /// what they're doing; `destroy` waits for them.
    pub async fn teardown_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        peer.mark_teardown();
        peer.set_state(PeerState::Torndown).await;
        peer.detach_device().await;
        let mut state = self.state.write().await;
        state.peers.remove_flow(peer.id);
        if let Some(socket) = peer.socket().await {
            socket.remove_peer_ref(peer.id).await;
        }
        tracing::info!(interface = %peer.name, "peer torn down");
    }

    /// Waits for the peer's refcount to reach zero, then drops it from
    /// the global peer list. No deadline.
    pub async fn destroy_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        peer.wait_for_quiescence().await;
        peer.detach_socket().await;
        let mut state = self.state.write().await;
        state.peers.unregister(peer.id);
        tracing::info!(interface = %peer.name, "peer destroyed");
    }

    pub async fn find_socket(&self, local: &Endpoint) -> Option<Arc<BoundSocket>> {
        self.state.read().await.sockets.find(local)
    }

    pub async fn find_socket_by_family(&self, ipv4: bool) -> Option<Arc<BoundSocket>> {
        self.state.read().await.sockets.find_by_family(ipv4)
    }

    pub async fn lookup_peer(&self, remote: &Endpoint) -> Option<Arc<Peer>> {
        self.state.read().await.peers.lookup(remote)
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.all_peers().len()
    }

    /// Full shutdown: stop every classifier loop, teardown and destroy
    /// every peer, then drop every socket.
    pub async fn shutdown(self: &Arc<Self>) {
        let (sockets, peers) = {
            let mut state = self.state.write().await;
            (state.sockets.drain(), state.peers.drain())
        };
        for peer in &peers {
            self.teardown_peer_quiet(peer).await;
        }
        for peer in peers {
            self.destroy_peer(&peer).await;
        }
        for socket in sockets {
            socket.close().await;
        }
        tracing::info!("module shutdown complete");
    }

    async fn teardown_peer_quiet(&self, peer: &Arc<Peer>) {
        peer.mark_teardown();
        peer.set_state(PeerState::Torndown).await;
        peer.detach_device().await;
    }
}

/// Derives this peer's TUN device configuration from the module config.
/// Each peer gets its own point-to-point device, matching the `fastd<n>`
/// interface model; addressing beyond "some address on this device"
/// belongs to the external handshake agent, not the core.
pub(crate) fn tun_config_for(config: &Config, peer: &Peer) -> crate::device::TunDeviceConfig {
    crate::device::TunDeviceConfig {
        name: peer.name.clone(),
        address: "169.254.0.1".to_string(),
        netmask: config.tun.netmask.clone(),
        mtu: if peer.mtu != 0 { peer.mtu } else { DEFAULT_MTU },
    }
}
