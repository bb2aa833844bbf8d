//! Encapsulator: frames an outbound payload with the fastd type byte and
//! sends it to the peer's remote endpoint over its bound socket.
//!
//! The component design describes manually prepending IP and UDP headers
//! because the original system intercepts packets below the kernel's own
//! UDP transmit path. Here the bound socket is a real `tokio::net::UdpSocket`,
//! so the kernel already builds the IP/UDP headers on `send_to`; this
//! function's job reduces to the part that is still ours: the fastd
//! framing byte plus peer bookkeeping and counters.

use std::sync::atomic::Ordering;

use crate::endpoint::Endpoint;
use crate::error::{CoreError, CoreResult};
use crate::peer::Peer;

const TYPE_DATA: u8 = 0x02;

/// Sends `payload` (a full IPv4/IPv6 packet, or empty for a keepalive
/// reply) to `dst` over `peer`'s bound socket.
pub(crate) async fn encapsulate(peer: &Peer, dst: Endpoint, payload: &[u8]) -> CoreResult<()> {
    if peer.is_torndown() {
        return Err(CoreError::NetworkDown);
    }
    let Some(socket) = peer.socket().await else {
        return Err(CoreError::NetworkDown);
    };

    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.push(TYPE_DATA);
    framed.extend_from_slice(payload);

    match socket.send_to(&framed, dst.addr()).await {
        Ok(n) => {
            peer.counters.opackets.fetch_add(1, Ordering::Relaxed);
            peer.counters.obytes.fetch_add(n as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            peer.counters.oerrors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(interface = %peer.name, error = %e, "encapsulated send failed");
            Err(e)
        }
    }
}

/// Drives the peer's TUN device: every packet the host stack originates
/// on this interface is encapsulated and sent to the peer's remote.
pub(crate) async fn run_output_pump(peer: std::sync::Arc<Peer>) {
    loop {
        let Some(device) = peer.device().await else {
            return;
        };
        let Some(packet) = device.recv().await else {
            return;
        };
        if peer.is_torndown() {
            continue;
        }
        let Some(remote) = peer.remote().await else {
            continue;
        };
        if let Err(e) = encapsulate(&peer, remote, &packet).await {
            tracing::debug!(interface = %peer.name, error = %e, "dropping outbound packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::v4;

    #[tokio::test]
    async fn encapsulate_fails_closed_without_socket() {
        let peer = Peer::new(0, [0u8; 32]);
        let remote = v4(10, 0, 0, 1, 9000);
        let err = encapsulate(&peer, remote, b"hello").await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkDown));
    }

    #[tokio::test]
    async fn encapsulate_fails_closed_after_teardown() {
        let peer = Peer::new(0, [0u8; 32]);
        peer.mark_teardown();
        let remote = v4(10, 0, 0, 1, 9000);
        let err = encapsulate(&peer, remote, b"hello").await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkDown));
    }

    #[tokio::test]
    async fn output_pump_is_aborted_on_device_detach() {
        // The pump blocks inside `device.recv()`, which a cooperative
        // "device is now None" check would never wake up to observe on its
        // own (see `Peer::detach_device`); this asserts the abort actually
        // lands rather than leaving the task (and the peer `Arc` it holds)
        // parked forever.
        let peer = Peer::new(0, [0u8; 32]);
        let (device, _harness) = crate::device::TunDevice::test_pair();
        peer.attach_device(std::sync::Arc::new(device)).await;

        let pump = tokio::spawn(run_output_pump(peer.clone()));
        let abort_handle = pump.abort_handle();
        peer.set_output_task(pump).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!abort_handle.is_finished(), "pump should still be running while a device is attached");

        peer.detach_device().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(abort_handle.is_finished(), "output pump must be aborted once its device is detached");
    }
}
