//! Hash-indexed flow table: `remote endpoint -> peer`, plus the global
//! list of every peer the module knows about (including ones not yet
//! configured with a remote).

use std::sync::Arc;

use crate::endpoint::{Endpoint, FASTD_HASH_SIZE};
use crate::peer::Peer;

/// Plain (unlocked) collection, intended to live behind the module's
/// single global lock. Each bucket entry carries the endpoint it was
/// filed under so lookups never need to re-read (async) peer state.
pub struct PeerTable {
    buckets: Vec<Vec<(Endpoint, Arc<Peer>)>>,
    all: Vec<Arc<Peer>>,
    hash_size: usize,
}

impl PeerTable {
    pub fn new(hash_size: usize) -> Self {
        let hash_size = if hash_size == 0 { FASTD_HASH_SIZE } else { hash_size };
        Self {
            buckets: (0..hash_size).map(|_| Vec::new()).collect(),
            all: Vec::new(),
            hash_size,
        }
    }

    pub fn register(&mut self, peer: Arc<Peer>) {
        self.all.push(peer);
    }

    pub fn unregister(&mut self, peer_id: u32) {
        self.all.retain(|p| p.id != peer_id);
    }

    /// Inserts into the flow hash. Caller must have already validated the
    /// remote via [`Peer::validate_remote`] and checked uniqueness via
    /// [`PeerTable::lookup`].
    pub fn insert_flow(&mut self, remote: Endpoint, peer: Arc<Peer>) {
        let bucket = remote.hash(self.hash_size);
        self.buckets[bucket].push((remote, peer));
    }

    /// Removes a peer from the flow hash by identity, scanning every
    /// bucket so this is correct even if the caller's notion of the
    /// peer's remote is stale.
    pub fn remove_flow(&mut self, peer_id: u32) {
        for bucket in &mut self.buckets {
            bucket.retain(|(_, p)| p.id != peer_id);
        }
    }

    pub fn lookup(&self, remote: &Endpoint) -> Option<Arc<Peer>> {
        let bucket = remote.hash(self.hash_size);
        self.buckets[bucket]
            .iter()
            .find(|(ep, _)| ep.equal(remote))
            .map(|(_, p)| p.clone())
    }

    /// True if some *other* peer already holds this remote in the flow
    /// table.
    pub fn remote_held_by_other(&self, remote: &Endpoint, peer_id: u32) -> Option<Arc<Peer>> {
        self.lookup(remote).filter(|p| p.id != peer_id)
    }

    pub fn all_peers(&self) -> &[Arc<Peer>] {
        &self.all
    }

    pub fn find_by_id(&self, peer_id: u32) -> Option<Arc<Peer>> {
        self.all.iter().find(|p| p.id == peer_id).cloned()
    }

    pub fn drain(&mut self) -> Vec<Arc<Peer>> {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        std::mem::take(&mut self.all)
    }
}
