//! Layered configuration: a TOML file read at startup, overridable by a
//! handful of CLI flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::endpoint::FASTD_HASH_SIZE;
use crate::handshake_ring::DEFAULT_RING_CAPACITY;
use crate::peer::DEFAULT_MTU;

#[derive(Debug, Deserialize, Clone)]
pub struct TunDefaults {
    #[serde(default = "default_netmask")]
    pub netmask: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

impl Default for TunDefaults {
    fn default() -> Self {
        Self {
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Local endpoints to bind at startup, e.g. `["0.0.0.0:10000"]`.
    #[serde(default)]
    pub bind: Vec<String>,
    /// Number of flow-table hash buckets.
    #[serde(default = "default_hash_size")]
    pub hash_size: usize,
    /// Capacity of the inbound handshake ring.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default)]
    pub tun: TunDefaults,
    /// Path to the control endpoint's Unix-domain-socket front-end, if any.
    pub control_socket: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive string, e.g. "info".
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_hash_size() -> usize {
    FASTD_HASH_SIZE
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            hash_size: default_hash_size(),
            ring_capacity: default_ring_capacity(),
            tun: TunDefaults::default(),
            control_socket: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("reading config {}: {e}", path.display()))?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| format!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    /// Applies CLI overrides on top of the file-loaded config, matching the
    /// teacher's flags-layer-over-file precedence.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.bind = vec![bind.clone()];
        }
        if let Some(filter) = &args.log_filter {
            self.log_filter = filter.clone();
        }
        if let Some(socket) = &args.control_socket {
            self.control_socket = Some(socket.clone());
        }
    }
}

/// CLI flags for the `fastd-core` daemon.
#[derive(Debug, Parser)]
#[command(name = "fastd-core", about = "User-space fastd-compatible tunnel datapath")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Overrides `bind` to a single local endpoint.
    #[arg(long)]
    pub bind: Option<String>,

    /// Overrides the `tracing_subscriber::EnvFilter` directive.
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Overrides the control endpoint's Unix-domain-socket path.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.hash_size, FASTD_HASH_SIZE);
        assert_eq!(cfg.ring_capacity, DEFAULT_RING_CAPACITY);
        assert!(cfg.bind.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_text = r#"
            bind = ["0.0.0.0:10000"]
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.bind, vec!["0.0.0.0:10000".to_string()]);
        assert_eq!(cfg.hash_size, FASTD_HASH_SIZE);
    }
}
