//! Control endpoint: the async equivalent of the `/dev/fastd` character
//! device plus the per-interface ioctl table.
//!
//! `ControlEndpoint` is the typed API an in-process agent or test uses
//! directly; [`control_socket`](crate::control_socket) frames the same
//! operations over a Unix-domain-socket for an out-of-process agent.

use std::sync::Arc;

use crate::endpoint::{Endpoint, FlatEndpoint, FLAT_ENDPOINT_LEN};
use crate::error::{CoreError, CoreResult};
use crate::handshake_ring::HandshakeMessage;
use crate::module::Module;
use crate::peer::Peer;

pub struct ControlEndpoint {
    module: Arc<Module>,
}

impl ControlEndpoint {
    pub fn new(module: Arc<Module>) -> Self {
        Self { module }
    }

    /// Drains one handshake message, or `None` if the ring is empty.
    pub async fn read(&self) -> Option<HandshakeMessage> {
        self.module.ring.try_dequeue().await
    }

    /// Resolves once the ring holds at least one message, the same signal
    /// a `poll`/`kqueue` waiter would receive from the real device.
    pub async fn readable(&self) {
        loop {
            if !self.is_ring_empty_hint().await {
                return;
            }
            self.module.ring.readable().await;
        }
    }

    async fn is_ring_empty_hint(&self) -> bool {
        let (enq, deq, dropped) = self.module.ring.counts();
        enq == deq + dropped
    }

    /// Sends a handshake datagram from `src` to `dst`. `src` is matched
    /// exactly against a bound socket's local endpoint first; a fallback
    /// to any socket of the same address family is permitted so simple
    /// single-socket setups don't need to round-trip the exact bind
    /// address through the caller.
    pub async fn write(&self, src: FlatEndpoint, dst: FlatEndpoint, data: Vec<u8>) -> CoreResult<()> {
        if data.is_empty() {
            return Err(CoreError::InvalidArgument("handshake payload must not be empty"));
        }
        let src_ep = Endpoint::from_flat(&src);
        let dst_ep = Endpoint::from_flat(&dst);

        let socket = match self.module.find_socket(&src_ep).await {
            Some(s) => s,
            None => self
                .module
                .find_socket_by_family(src_ep.is_ipv4())
                .await
                .ok_or(CoreError::NotFound)?,
        };
        socket.send_to(&data, dst_ep.addr()).await?;
        Ok(())
    }

    pub async fn bind(&self, local: FlatEndpoint) -> CoreResult<()> {
        self.module.bind(Endpoint::from_flat(&local)).await
    }

    pub async fn close(&self, local: FlatEndpoint) -> CoreResult<()> {
        self.module.close(Endpoint::from_flat(&local)).await
    }
}

/// Per-interface ioctl opcodes, matching the driver-specific numbering in
/// the external-interfaces section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIoctl {
    GetRemote = 0,
    SetRemote = 1,
    GetStats = 2,
}

impl TryFrom<u8> for PeerIoctl {
    type Error = CoreError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PeerIoctl::GetRemote),
            1 => Ok(PeerIoctl::SetRemote),
            2 => Ok(PeerIoctl::GetStats),
            _ => Err(CoreError::InvalidArgument("unknown peer ioctl opcode")),
        }
    }
}

const GET_REMOTE_REPLY_LEN: usize = 32 + FLAT_ENDPOINT_LEN;
const SET_REMOTE_ARG_LEN: usize = 32 + FLAT_ENDPOINT_LEN;
const GET_STATS_REPLY_LEN: usize = 8 + 8;

/// Generic copy-in/copy-out dispatch, the user-space analogue of the
/// kernel's `{func, arg_size, direction}` ioctl table. `buf` is both the
/// argument (for `SET_REMOTE`) and, on success, overwritten with the
/// reply (for `GET_REMOTE`/`GET_STATS`); returns the number of valid
/// bytes written back into `buf`.
pub async fn dispatch_raw(module: &Arc<Module>, peer: &Arc<Peer>, opcode: u8, buf: &mut Vec<u8>) -> CoreResult<usize> {
    let op = PeerIoctl::try_from(opcode)?;
    match op {
        PeerIoctl::GetRemote => {
            buf.clear();
            buf.resize(GET_REMOTE_REPLY_LEN, 0);
            let pubkey = peer.pubkey().await;
            let remote = peer.remote().await.unwrap_or_else(|| Endpoint::from_flat(&[0u8; FLAT_ENDPOINT_LEN]));
            buf[..32].copy_from_slice(&pubkey);
            buf[32..].copy_from_slice(&remote.to_flat());
            Ok(GET_REMOTE_REPLY_LEN)
        }
        PeerIoctl::SetRemote => {
            if buf.len() != SET_REMOTE_ARG_LEN {
                return Err(CoreError::InvalidArgument("SET_REMOTE expects a 50-byte pubkey+flat-endpoint argument"));
            }
            let mut pubkey = [0u8; 32];
            pubkey.copy_from_slice(&buf[..32]);
            let mut flat = [0u8; FLAT_ENDPOINT_LEN];
            flat.copy_from_slice(&buf[32..]);
            let remote = Endpoint::from_flat(&flat);
            module.set_remote(peer, remote, pubkey).await?;
            Ok(0)
        }
        PeerIoctl::GetStats => {
            buf.clear();
            buf.resize(GET_STATS_REPLY_LEN, 0);
            let ipackets = peer.counters.ipackets.load(std::sync::atomic::Ordering::Relaxed);
            let opackets = peer.counters.opackets.load(std::sync::atomic::Ordering::Relaxed);
            buf[..8].copy_from_slice(&ipackets.to_be_bytes());
            buf[8..].copy_from_slice(&opackets.to_be_bytes());
            Ok(GET_STATS_REPLY_LEN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_opcode() {
        assert!(PeerIoctl::try_from(9).is_err());
    }

    #[test]
    fn known_opcodes_round_trip() {
        assert_eq!(PeerIoctl::try_from(0).unwrap(), PeerIoctl::GetRemote);
        assert_eq!(PeerIoctl::try_from(1).unwrap(), PeerIoctl::SetRemote);
        assert_eq!(PeerIoctl::try_from(2).unwrap(), PeerIoctl::GetStats);
    }
}
