//! Decapsulator: strips fastd framing from an inbound data datagram and
//! hands the result to the peer's TUN device (standing in for the host
//! IP stack), or answers a keepalive in place.

use std::sync::atomic::Ordering;

use crate::endpoint::Endpoint;
use crate::peer::AcquiredPeer;

/// `datagram` starts at the fastd type byte (`0x02`).
pub(crate) async fn decapsulate(peer: &AcquiredPeer, remote: Endpoint, datagram: &[u8]) {
    let payload = &datagram[1..];

    if payload.is_empty() {
        // A datagram carrying only the fastd type byte (datalen == 1) is
        // a keepalive; echo it straight back rather than passing it to
        // the IP stack.
        peer.counters.ipackets.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(interface = %peer.name, "keepalive received, echoing");
        let _ = crate::encap::encapsulate(peer, remote, &[]).await;
        return;
    }

    let version = payload[0] >> 4;
    if version != 4 && version != 6 {
        peer.counters.ierrors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(interface = %peer.name, version, "dropping decapsulated packet with unrecognized IP version");
        return;
    }

    let Some(device) = peer.device().await else {
        peer.counters.ierrors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(interface = %peer.name, "dropping decapsulated packet, no device attached");
        return;
    };

    if let Err(e) = device.send(payload.to_vec()).await {
        peer.counters.ierrors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(interface = %peer.name, error = %e, "failed to deliver decapsulated packet to device");
        return;
    }

    peer.counters.ipackets.fetch_add(1, Ordering::Relaxed);
    peer.counters.ibytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::v4;
    use crate::peer::Peer;

    #[tokio::test]
    async fn keepalive_is_bare_type_byte() {
        let peer = Peer::new(0, [0u8; 32]);
        // No device/socket attached; decapsulate should not panic and
        // should take the keepalive branch (datagram is just the fastd
        // type byte), which attempts to re-encapsulate and silently
        // no-ops without a socket attached.
        let acquired = peer.acquire();
        let remote = v4(10, 0, 0, 1, 9000);
        decapsulate(&acquired, remote, &[0x02]).await;
        assert_eq!(peer.counters.ipackets.load(Ordering::Relaxed), 1);
        assert_eq!(peer.counters.ibytes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unrecognized_ip_version_is_dropped_not_panicked() {
        let peer = Peer::new(0, [0u8; 32]);
        let acquired = peer.acquire();
        let remote = v4(10, 0, 0, 1, 9000);
        // high nibble 0x5 is neither 4 nor 6
        decapsulate(&acquired, remote, &[0x02, 0x50, 0x00]).await;
        assert_eq!(peer.counters.ipackets.load(Ordering::Relaxed), 0);
        assert_eq!(peer.counters.ierrors.load(Ordering::Relaxed), 1);
    }
}
