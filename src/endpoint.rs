//! Unified IPv4/IPv6 endpoint type and its 18-byte wire form.
//!
//! # Flat endpoint layout (18 bytes)
//! ```text
//! +------------------------------------------------+--------+
//! |         address, IPv4-mapped into IPv6 (16B)    | port(2)|
//! +------------------------------------------------+--------+
//! ```
//! An IPv4 address `a.b.c.d` is stored as `::ffff:a.b.c.d`: the first ten
//! bytes zero, bytes 10-11 set to `0xff`, bytes 12-15 the IPv4 octets.
//! This is the external ABI used by the control endpoint and by
//! handshake-message headers; everywhere else an [`Endpoint`] is used.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub const FLAT_ENDPOINT_LEN: usize = 18;
pub const FASTD_HASH_SIZE: usize = 64;

pub type FlatEndpoint = [u8; FLAT_ENDPOINT_LEN];

/// A remote or local tunnel endpoint. Thin wrapper over `SocketAddr` that
/// additionally carries the IPv6 scope id, since the kernel sockaddr form
/// does and the flat form's round-trip invariant depends on it.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    addr: SocketAddr,
    scope_id: u32,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        let scope_id = match addr {
            SocketAddr::V6(v6) => v6.scope_id(),
            SocketAddr::V4(_) => 0,
        };
        Self { addr, scope_id }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// True for the unspecified address (`0.0.0.0` / `::`) regardless of
    /// port; bind targets and add_peer remotes reject this.
    pub fn is_unspecified(&self) -> bool {
        match self.addr {
            SocketAddr::V4(v4) => v4.ip().is_unspecified(),
            SocketAddr::V6(v6) => v6.ip().is_unspecified(),
        }
    }

    /// Hash bucket index for the flow table. Deliberately cheap: collisions
    /// within a bucket are resolved by a linear scan with [`Endpoint::equal`].
    pub fn hash(&self, table_size: usize) -> usize {
        self.addr.port() as usize % table_size
    }

    /// IPv6 scope-id zero-match: a zero scope id on either side matches any
    /// scope id on the other.
    pub fn equal(&self, other: &Endpoint) -> bool {
        if self.addr.port() != other.addr.port() {
            return false;
        }
        match (self.addr, other.addr) {
            (SocketAddr::V4(a), SocketAddr::V4(b)) => a.ip() == b.ip(),
            (SocketAddr::V6(a), SocketAddr::V6(b)) => {
                if a.ip() != b.ip() {
                    return false;
                }
                self.scope_id == 0 || other.scope_id == 0 || self.scope_id == other.scope_id
            }
            _ => false,
        }
    }

    pub fn to_flat(&self) -> FlatEndpoint {
        let mut buf = [0u8; FLAT_ENDPOINT_LEN];
        let mapped = match self.addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            std::net::IpAddr::V6(v6) => v6,
        };
        buf[..16].copy_from_slice(&mapped.octets());
        buf[16..18].copy_from_slice(&self.addr.port().to_be_bytes());
        buf
    }

    pub fn from_flat(flat: &FlatEndpoint) -> Self {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&flat[..16]);
        let port = u16::from_be_bytes([flat[16], flat[17]]);
        let v6 = Ipv6Addr::from(octets);
        let addr = match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
            None => SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0)),
        };
        Endpoint::new(addr)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Convenience for building a loopback IPv4 placeholder in tests.
#[allow(dead_code)]
pub(crate) fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
    Endpoint::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_round_trip_ipv4() {
        let e = v4(203, 0, 113, 7, 4433);
        let flat = e.to_flat();
        let back = Endpoint::from_flat(&flat);
        assert!(e.equal(&back));
        assert_eq!(flat, back.to_flat());
    }

    #[test]
    fn flat_round_trip_ipv6() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let e = Endpoint::new(addr);
        let flat = e.to_flat();
        let back = Endpoint::from_flat(&flat);
        assert!(e.equal(&back));
    }

    #[test]
    fn scope_id_zero_matches_any() {
        let a = Endpoint::new(SocketAddr::V6(SocketAddrV6::new(
            "2001:db8::1".parse().unwrap(),
            9000,
            0,
            0,
        )));
        let b = Endpoint::new(SocketAddr::V6(SocketAddrV6::new(
            "2001:db8::1".parse().unwrap(),
            9000,
            0,
            7,
        )));
        assert!(a.equal(&b));
    }

    #[test]
    fn different_ports_not_equal() {
        let a = v4(1, 2, 3, 4, 100);
        let b = v4(1, 2, 3, 4, 101);
        assert!(!a.equal(&b));
    }

    #[test]
    fn unspecified_detection() {
        let e = Endpoint::new("0.0.0.0:10000".parse().unwrap());
        assert!(e.is_unspecified());
        let e = v4(1, 2, 3, 4, 10000);
        assert!(!e.is_unspecified());
    }
}
