//! End-to-end exercises of the datapath against real UDP sockets, the way
//! the teacher's `tests/peer_integration_test.rs` drives `PeerHandler`
//! against mock UDP peers rather than mocking the socket layer itself.
//! Peer data paths use `TunDevice::test_pair` so decap/encap run for real
//! without the root privileges a genuine TUN device would need.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fastd_core::config::Config;
use fastd_core::control::ControlEndpoint;
use fastd_core::device::TunDevice;
use fastd_core::endpoint::Endpoint;
use fastd_core::module::Module;

fn module() -> Arc<Module> {
    Module::new(Config::default())
}

/// Reserves an ephemeral loopback port and releases it immediately so the
/// module can bind the exact (now-concrete) address; avoids ever handing
/// `0.0.0.0:0`/`:0` into the socket table, whose exact-match lookups need a
/// real port.
fn free_loopback_port() -> SocketAddr {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

async fn loopback_udp() -> (tokio::net::UdpSocket, SocketAddr) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

#[tokio::test]
async fn bind_close_rebind() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());

    m.bind(local).await.unwrap();

    // binding the exact same local endpoint again must fail (address in use)
    let err = m.bind(local).await.unwrap_err();
    assert!(matches!(err, fastd_core::CoreError::Io(_)));

    m.close(local).await.unwrap();
    assert!(m.find_socket(&local).await.is_none());

    // rebinding the same address after close succeeds again
    m.bind(local).await.unwrap();
}

#[tokio::test]
async fn handshake_pickup_via_control_endpoint() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let control = ControlEndpoint::new(m.clone());

    let (peer_sock, peer_addr) = loopback_udp().await;
    peer_sock
        .send_to(&[0x01, 0xaa, 0xbb, 0xcc], local.addr())
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(msg) = control.read().await {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handshake never arrived");

    assert_eq!(msg.data, vec![0x01, 0xaa, 0xbb, 0xcc]);
    assert_eq!(msg.src, Endpoint::new(peer_addr).to_flat());
    assert_eq!(msg.dst, local.to_flat());
}

#[tokio::test]
async fn flow_table_conflict_on_set_remote() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let remote = Endpoint::new("203.0.113.9:4433".parse().unwrap());

    let fastd0 = m.clone_create([1u8; 32], None).await.unwrap();
    let (device0, _harness0) = TunDevice::test_pair();
    m.add_peer_with_device(&fastd0, remote, [1u8; 32], device0).await.unwrap();

    let fastd1 = m.clone_create([2u8; 32], None).await.unwrap();

    let err = m.set_remote(&fastd1, remote, [2u8; 32]).await.unwrap_err();
    assert!(matches!(err, fastd_core::CoreError::Busy));

    // the original holder is untouched
    assert_eq!(fastd0.remote().await, Some(remote));
    assert_eq!(fastd1.remote().await, None);
}

#[tokio::test]
async fn set_remote_is_noop_for_same_endpoint() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let remote = Endpoint::new("203.0.113.9:4433".parse().unwrap());
    let peer = m.clone_create([1u8; 32], None).await.unwrap();
    let (device, _harness) = TunDevice::test_pair();
    m.add_peer_with_device(&peer, remote, [1u8; 32], device).await.unwrap();

    m.set_remote(&peer, remote, [9u8; 32]).await.unwrap();
    assert_eq!(peer.pubkey().await, [9u8; 32]);
}

#[tokio::test]
async fn data_decapsulation_reaches_device() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let (peer_sock, peer_addr) = loopback_udp().await;
    let remote = Endpoint::new(peer_addr);

    let peer = m.clone_create([3u8; 32], None).await.unwrap();
    let (device, harness) = TunDevice::test_pair();
    m.add_peer_with_device(&peer, remote, [3u8; 32], device).await.unwrap();

    // "02 45 00 ..." => fastd data byte, then an IPv4 packet (high nibble 4)
    let datagram = [0x02u8, 0x45, 0x00, 0x00, 0x14];
    peer_sock.send_to(&datagram, local.addr()).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), harness.next_delivered())
        .await
        .expect("packet never reached the device")
        .expect("channel closed");

    assert_eq!(delivered, datagram[1..]);
    assert_eq!(peer.counters.ipackets.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn encapsulation_round_trip() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let (peer_sock, peer_addr) = loopback_udp().await;
    let remote = Endpoint::new(peer_addr);

    let peer = m.clone_create([4u8; 32], None).await.unwrap();
    let (device, harness) = TunDevice::test_pair();
    m.add_peer_with_device(&peer, remote, [4u8; 32], device).await.unwrap();

    let ip_packet = vec![0x45u8, 0x00, 0x00, 0x1c, 0xaa, 0xbb];
    harness.originate(ip_packet.clone()).await;

    let mut buf = vec![0u8; 2048];
    let (n, _from) = tokio::time::timeout(Duration::from_secs(2), peer_sock.recv_from(&mut buf))
        .await
        .expect("encapsulated datagram never arrived")
        .unwrap();

    assert_eq!(buf[0], 0x02);
    assert_eq!(&buf[1..n], &ip_packet[..]);
    assert_eq!(peer.counters.opackets.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn keepalive_is_echoed_back() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let (peer_sock, peer_addr) = loopback_udp().await;
    let remote = Endpoint::new(peer_addr);

    let peer = m.clone_create([5u8; 32], None).await.unwrap();
    let (device, _harness) = TunDevice::test_pair();
    m.add_peer_with_device(&peer, remote, [5u8; 32], device).await.unwrap();

    // datalen == 1: a lone fastd data byte is a keepalive
    peer_sock.send_to(&[0x02u8], local.addr()).await.unwrap();

    let mut buf = vec![0u8; 64];
    let (n, _from) = tokio::time::timeout(Duration::from_secs(2), peer_sock.recv_from(&mut buf))
        .await
        .expect("keepalive reply never arrived")
        .unwrap();

    assert_eq!(&buf[..n], &[0x02u8]);
}

#[tokio::test]
async fn ring_overflow_drops_without_crashing() {
    let mut config = Config::default();
    config.ring_capacity = 4;
    let m = Module::new(config);
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();
    let control = ControlEndpoint::new(m.clone());

    let (peer_sock, _peer_addr) = loopback_udp().await;
    for i in 0u8..8 {
        peer_sock.send_to(&[0x01, 0xaa, 0xbb, i], local.addr()).await.unwrap();
    }

    // give the classifier task time to drain the socket
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (enqueued, _dequeued, dropped) = m.ring.counts();
    assert!(enqueued <= 4, "ring must never hold more than its capacity");
    assert!(dropped > 0, "overflowing handshakes must be dropped, not buffered indefinitely");

    let mut drained = 0;
    while control.read().await.is_some() {
        drained += 1;
    }
    assert_eq!(drained as u64, enqueued);

    // a fresh handshake after draining is queued again, not permanently wedged
    peer_sock.send_to(&[0x01, 0x01, 0x02, 0x03], local.addr()).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(msg) = control.read().await {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ring did not recover after drain");
    assert_eq!(msg.data, vec![0x01, 0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn teardown_then_destroy_waits_for_quiescence() {
    let m = module();
    let local = Endpoint::new(free_loopback_port());
    m.bind(local).await.unwrap();

    let remote = Endpoint::new("198.51.100.7:5555".parse().unwrap());
    let peer = m.clone_create([6u8; 32], None).await.unwrap();
    let (device, _harness) = TunDevice::test_pair();
    m.add_peer_with_device(&peer, remote, [6u8; 32], device).await.unwrap();

    let acquired = peer.acquire();
    assert!(!peer.is_torndown());

    m.teardown_peer(&peer).await;
    assert!(peer.is_torndown());
    assert!(m.lookup_peer(&remote).await.is_none());

    let destroy = tokio::spawn({
        let m = m.clone();
        let peer = peer.clone();
        async move { m.destroy_peer(&peer).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!destroy.is_finished(), "destroy must wait while a reference is held");

    drop(acquired);
    tokio::time::timeout(Duration::from_secs(2), destroy)
        .await
        .expect("destroy never completed after the last reference dropped")
        .unwrap();
}
