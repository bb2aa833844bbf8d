//! Inbound classifier: the receive loop installed on every bound socket.
//! Dispatches on the first payload byte to either the handshake ring or
//! the peer datapath.

use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::handshake_ring::HandshakeMessage;
use crate::module::Module;
use crate::socket_table::BoundSocket;

const TYPE_HANDSHAKE: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;

/// Runs until the socket is closed (its task aborted) or the module is
/// dropped.
pub(crate) async fn run(module: std::sync::Weak<Module>, socket: Arc<BoundSocket>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (n, src) = match socket.raw().recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "udp recv failed");
                continue;
            }
        };

        let Some(module) = module.upgrade() else {
            return;
        };

        if n < 1 {
            continue;
        }

        let remote = Endpoint::new(src);
        match buf[0] {
            TYPE_HANDSHAKE => classify_handshake(&module, &socket, remote, &buf[..n]).await,
            TYPE_DATA => classify_data(&module, remote, &buf[..n]).await,
            other => {
                tracing::debug!(byte = other, "dropping datagram with unknown fastd type byte");
            }
        }
    }
}

async fn classify_handshake(module: &Arc<Module>, socket: &Arc<BoundSocket>, remote: Endpoint, datagram: &[u8]) {
    if datagram.len() < 4 {
        tracing::debug!(len = datagram.len(), "dropping too-short handshake");
        return;
    }
    let msg = HandshakeMessage {
        src: remote.to_flat(),
        dst: socket.local().to_flat(),
        data: datagram.to_vec(),
    };
    module.ring.try_enqueue(msg);
}

async fn classify_data(module: &Arc<Module>, remote: Endpoint, datagram: &[u8]) {
    let Some(peer) = module.lookup_peer(&remote).await else {
        tracing::debug!(remote = %remote, "dropping data for unknown peer");
        return;
    };
    if peer.is_torndown() {
        tracing::debug!(interface = %peer.name, "dropping data for torndown peer");
        return;
    }
    let acquired = peer.acquire();
    crate::decap::decapsulate(&acquired, remote, datagram).await;
}
