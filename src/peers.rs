use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::addr::ClusterAddr;

#[derive(Clone, Default)]
/// The live peer-address set of the local node.
///
/// This is the only cluster configuration that changes after bootstrap. It
/// has exactly two producers: bootstrap seeds it once, and the reconciler
/// adds to it repeatedly. Adding an already-present peer is a no-op, never
/// an error, so concurrent additions of the same peer are idempotent.
pub struct LivePeerSet {
    inner: Arc<RwLock<BTreeSet<ClusterAddr>>>,
}

impl LivePeerSet {
    /// Adds a peer. Returns `true` if the peer was not already present.
    pub fn insert(&self, addr: ClusterAddr) -> bool {
        self.inner.write().insert(addr)
    }

    pub fn contains(&self, addr: &ClusterAddr) -> bool {
        self.inner.read().contains(addr)
    }

    /// Drops a peer the transport's failure detector has declared dead.
    ///
    /// Never called on registry evidence alone.
    pub fn remove(&self, addr: &ClusterAddr) -> bool {
        self.inner.write().remove(addr)
    }

    pub fn snapshot(&self) -> BTreeSet<ClusterAddr> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let peers = LivePeerSet::default();
        let addr = ClusterAddr::new("10.0.0.2", 5701);

        assert!(peers.insert(addr.clone()));
        assert!(!peers.insert(addr.clone()));
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&addr));
    }

    #[test]
    fn remove_only_affects_present_peers() {
        let peers = LivePeerSet::default();
        let addr = ClusterAddr::new("10.0.0.2", 5701);
        assert!(!peers.remove(&addr));
        peers.insert(addr.clone());
        assert!(peers.remove(&addr));
        assert!(peers.is_empty());
    }
}
