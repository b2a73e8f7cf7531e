use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the grid coordination system.
pub struct GridStatistics(Arc<GridStatisticsInner>);

impl Deref for GridStatistics {
    type Target = GridStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct GridStatisticsInner {
    /// The number of currently alive members the node is aware of.
    pub(crate) num_live_members: Counter,
    /// The number of peers the failure detector currently believes dead.
    pub(crate) num_dead_members: Counter,
    /// The number of client (lite) nodes connected through this node.
    pub(crate) num_connected_clients: Counter,
    /// Peers added to the live peer set since startup.
    pub(crate) num_peers_added: Counter,
    /// Live members flagged as possibly stale because the registry no
    /// longer lists them.
    pub(crate) num_stale_suspects: Counter,
    /// Completed reconciliation ticks.
    pub(crate) num_reconcile_ticks: Counter,
}

impl GridStatisticsInner {
    pub fn num_live_members(&self) -> u64 {
        self.num_live_members.load(Ordering::Relaxed)
    }

    pub fn num_dead_members(&self) -> u64 {
        self.num_dead_members.load(Ordering::Relaxed)
    }

    pub fn num_connected_clients(&self) -> u64 {
        self.num_connected_clients.load(Ordering::Relaxed)
    }

    pub fn num_peers_added(&self) -> u64 {
        self.num_peers_added.load(Ordering::Relaxed)
    }

    pub fn num_stale_suspects(&self) -> u64 {
        self.num_stale_suspects.load(Ordering::Relaxed)
    }

    pub fn num_reconcile_ticks(&self) -> u64 {
        self.num_reconcile_ticks.load(Ordering::Relaxed)
    }
}
