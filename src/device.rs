//! Async TUN device adapter.
//!
//! Stands in for "the host IP stack" referenced throughout the component
//! design: packets the decapsulator produces are written here; packets
//! read from here are handed to the encapsulator. One device is created
//! per peer, matching the point-to-point `fastd<n>` interface model.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct TunDeviceConfig {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub mtu: u16,
}

/// A running TUN device plus the channels used to shuttle packets to and
/// from the task that owns the file descriptor.
pub struct TunDevice {
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl TunDevice {
    /// Creates the device and spawns its read/write pump task. Requires
    /// the privileges the host platform demands for TUN creation; on
    /// failure the caller should treat it the same as any other
    /// interface-bring-up failure (AddressNotAvailable/Io at the call
    /// site, not here).
    pub fn spawn(config: TunDeviceConfig) -> Result<Self> {
        let mut tun_config = tun::Configuration::default();
        tun_config
            .tun_name(config.name.clone())
            .address(config.address.clone())
            .netmask(config.netmask.clone())
            .mtu(config.mtu as u16)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform| {
            platform.ensure_root_privileges(true);
        });

        let mut dev = tun::create_as_async(&tun_config)?;

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(1024);

        let name = config.name.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; config.mtu as usize + 64];
            loop {
                tokio::select! {
                    read = dev.read(&mut buf) => {
                        match read {
                            Ok(n) => {
                                if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                                    tracing::debug!(interface = %name, "tun inbound channel closed, stopping pump");
                                    break;
                                }
                            }
                            Err(e) => tracing::error!(interface = %name, error = %e, "tun read failed"),
                        }
                    }
                    packet = outbound_rx.recv() => {
                        match packet {
                            Some(packet) => {
                                if let Err(e) = dev.write(&packet).await {
                                    tracing::error!(interface = %name, error = %e, "tun write failed");
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
        })
    }

    /// Reads one packet originated by the host stack for encapsulation.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Hands a decapsulated packet to the host stack.
    pub async fn send(&self, packet: Vec<u8>) -> Result<()> {
        self.outbound_tx
            .send(packet)
            .await
            .map_err(|e| -> crate::error::Error { Box::new(e) })
    }

    /// Builds a device backed by plain channels instead of a real TUN file
    /// descriptor, paired with a [`TestHarness`] a test uses to stand in
    /// for the host IP stack. Lets the datapath's decap/encap paths run
    /// end to end without the root/NET_ADMIN privileges real TUN creation
    /// needs, the same separation of "channels" from "the pump that reads
    /// the fd" the TUN adapter itself uses between construction and
    /// `spawn`.
    pub fn test_pair() -> (Self, TestHarness) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(1024);
        let device = Self {
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
        };
        let harness = TestHarness {
            inbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        };
        (device, harness)
    }
}

/// The test-side end of a [`TunDevice::test_pair`]: injects packets as if
/// they originated from the host stack, and observes packets the
/// decapsulator delivered to it.
pub struct TestHarness {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl TestHarness {
    /// Injects a packet as though the host stack originated it on this
    /// interface; the encapsulator will pick it up via `TunDevice::recv`.
    pub async fn originate(&self, packet: Vec<u8>) {
        let _ = self.inbound_tx.send(packet).await;
    }

    /// Waits for the next packet the decapsulator delivered to the device.
    pub async fn next_delivered(&self) -> Option<Vec<u8>> {
        self.outbound_rx.lock().await.recv().await
    }
}
