//! User-space datapath for a fastd-compatible layer-3 tunnel: UDP
//! termination, handshake/data demultiplexing, the peer/flow table, and
//! encapsulation/decapsulation against a per-peer TUN device. The
//! handshake/key-exchange agent and actual cryptography live outside
//! this crate; payload is shuttled as opaque bytes.

pub mod classifier;
pub mod config;
pub mod config_watcher;
pub mod control;
pub mod control_socket;
pub mod decap;
pub mod device;
pub mod encap;
pub mod endpoint;
pub mod error;
pub mod handshake_ring;
pub mod module;
pub mod peer;
pub mod peer_table;
pub mod socket_table;

pub use error::{CoreError, CoreResult, Error, Result};
pub use module::Module;

/// Installs a `tracing` subscriber reading its filter from `directive`
/// (an `EnvFilter`-style string, e.g. `"info"` or `"fastd_core=debug"`),
/// falling back to `RUST_LOG` when set.
pub fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
