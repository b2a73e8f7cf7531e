use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::addr::ClusterAddr;
use crate::error::GridError;
use crate::map::GridMap;
use crate::net::{GridListener, PeerEvent, PeerNetwork};
use crate::peers::LivePeerSet;
use crate::plan::ClusterPlan;
use crate::queue::{PriorityComparator, SharedQueue};
use crate::registry::RegistryHandle;
use crate::statistics::GridStatistics;
use crate::topology::NodeRole;

#[derive(Clone, Debug, Eq, PartialEq)]
/// One node of the grid cluster as seen by its peers.
pub struct GridMember {
    /// The fixed logical instance name of the node.
    pub instance_id: String,
    /// The advertised cluster address of the node.
    pub addr: ClusterAddr,
    /// Member or client. Decided once at startup, never flipped.
    pub role: NodeRole,
    /// Human-readable name for logs and debugging.
    pub display_name: Option<String>,
}

impl GridMember {
    pub fn new(
        instance_id: impl Into<String>,
        addr: ClusterAddr,
        role: NodeRole,
        display_name: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            addr,
            role,
            display_name,
        }
    }
}

pub type GridMembership = BTreeMap<ClusterAddr, GridMember>;

/// The live cluster handle produced by bootstrap.
///
/// Application code reaches the configured maps and the shared job queue
/// through this; the reconciler and discovery reach the live peer set and
/// membership through it.
pub struct GridNode {
    me: GridMember,
    plan: Arc<ClusterPlan>,
    registry: RegistryHandle,
    peers: LivePeerSet,
    network: PeerNetwork,
    listener: Option<GridListener>,
    members: watch::Receiver<GridMembership>,
    maps: Arc<RwLock<HashMap<String, GridMap>>>,
    queues: Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>,
    statistics: GridStatistics,
    started_at: Instant,
    ready: Arc<Notify>,
    stop: Arc<AtomicBool>,
}

impl GridNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        me: GridMember,
        plan: Arc<ClusterPlan>,
        registry: RegistryHandle,
        peers: LivePeerSet,
        network: PeerNetwork,
        listener: Option<GridListener>,
        events: flume::Receiver<PeerEvent>,
        statistics: GridStatistics,
    ) -> Self {
        let (members_tx, members_rx) = watch::channel(GridMembership::new());
        let stop = Arc::new(AtomicBool::new(false));

        let initial = GridMembership::from_iter([(me.addr.clone(), me.clone())]);
        statistics.num_live_members.store(
            initial.values().filter(|m| m.role == NodeRole::Member).count() as u64,
            Ordering::Relaxed,
        );
        if members_tx.send(initial).is_err() {
            error!("Failed to add itself as the initial member of the cluster.");
        }

        tokio::spawn(run_membership(
            me.clone(),
            events,
            members_tx,
            peers.clone(),
            network.clone(),
            statistics.clone(),
            stop.clone(),
        ));

        Self {
            me,
            plan,
            registry,
            peers,
            network,
            listener,
            members: members_rx,
            maps: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            statistics,
            started_at: Instant::now(),
            ready: Arc::new(Notify::new()),
            stop,
        }
    }

    #[inline]
    /// The cluster member of the node itself.
    pub fn me(&self) -> &GridMember {
        &self.me
    }

    #[inline]
    /// The immutable plan this node was bootstrapped from.
    pub fn plan(&self) -> &ClusterPlan {
        &self.plan
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> GridStatistics {
        self.statistics.clone()
    }

    #[inline]
    /// The registry handle this node publishes itself through.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    #[inline]
    pub(crate) fn peers(&self) -> &LivePeerSet {
        &self.peers
    }

    #[inline]
    pub(crate) fn network(&self) -> &PeerNetwork {
        &self.network
    }

    #[inline]
    pub(crate) fn members_watcher(&self) -> watch::Receiver<GridMembership> {
        self.members.clone()
    }

    /// A snapshot of the current cluster membership, including this node.
    pub fn members(&self) -> GridMembership {
        self.members.borrow().clone()
    }

    /// Return a [WatchStream] for monitoring membership changes.
    pub fn member_change_watcher(&self) -> WatchStream<GridMembership> {
        WatchStream::new(self.members.clone())
    }

    /// The live member-address set: every `Member`-role node currently part
    /// of the cluster, the local node included.
    pub fn live_member_addrs(&self) -> BTreeSet<ClusterAddr> {
        self.members
            .borrow()
            .values()
            .filter(|member| member.role == NodeRole::Member)
            .map(|member| member.addr.clone())
            .collect()
    }

    /// The peer addresses known to the live network configuration.
    pub fn peer_addrs(&self) -> BTreeSet<ClusterAddr> {
        self.peers.snapshot()
    }

    /// Adds a peer to the live network configuration and dials it.
    ///
    /// Adding an already-present peer (or the node itself) is a no-op.
    /// Returns `true` if the peer was newly added.
    pub fn add_peer(&self, addr: ClusterAddr) -> bool {
        if addr == self.me.addr {
            return false;
        }
        let newly_added = self.peers.insert(addr.clone());
        if newly_added {
            self.statistics.num_peers_added.fetch_add(1, Ordering::Relaxed);
            self.network.connect(addr);
        }
        newly_added
    }

    /// Whether the cluster currently satisfies its split-brain quorum.
    ///
    /// Always true for clients and for nodes without a quorum policy. The
    /// first evaluation is delayed by a grace period after startup so that
    /// normal bootstrap convergence is not mistaken for a partition.
    pub fn is_quorate(&self) -> bool {
        let Some(quorum) = &self.plan.quorum else {
            return true;
        };
        if self.started_at.elapsed() < quorum.first_eval_delay {
            return true;
        }
        self.live_member_addrs().len() >= quorum.minimum_cluster_size
    }

    /// Named map access with the policies configured at bootstrap.
    pub fn map(&self, name: &str) -> GridMap {
        if let Some(map) = self.maps.read().get(name) {
            return map.clone();
        }

        let mut maps = self.maps.write();
        maps.entry(name.to_string())
            .or_insert_with(|| GridMap::new(name, self.plan.policy_for(name)))
            .clone()
    }

    /// The named shared priority queue, ordered by the injected comparator.
    ///
    /// Only available on queue-bearing roles; the comparator is supplied by
    /// the build-scheduling subsystem. Repeated calls return the same queue
    /// and must use the same job type.
    pub fn shared_queue<T: Send + 'static>(
        &self,
        comparator: PriorityComparator<T>,
    ) -> Result<SharedQueue<T>, GridError> {
        let spec = self.plan.queue.as_ref().ok_or(GridError::QueueNotConfigured)?;

        if let Some(existing) = self.queues.read().get(&spec.name) {
            return existing
                .downcast_ref::<SharedQueue<T>>()
                .cloned()
                .ok_or_else(|| GridError::QueueTypeConflict(spec.name.clone()));
        }

        let mut queues = self.queues.write();
        if let Some(existing) = queues.get(&spec.name) {
            return existing
                .downcast_ref::<SharedQueue<T>>()
                .cloned()
                .ok_or_else(|| GridError::QueueTypeConflict(spec.name.clone()));
        }

        let queue = SharedQueue::new(spec.name.clone(), spec.backup_count, comparator);
        queues.insert(spec.name.clone(), Box::new(queue.clone()));
        Ok(queue)
    }

    /// Signals that the surrounding application has fully started, firing
    /// the one-shot early-connect task.
    pub fn signal_ready(&self) {
        self.ready.notify_one();
    }

    pub(crate) fn ready_signal(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Leaves the cluster and stops all background tasks.
    pub async fn shutdown(self) {
        info!(self_addr = %self.me.addr, "Shutting down the grid node.");
        self.stop.store(true, Ordering::Relaxed);
        self.network.shutdown();
        if let Some(listener) = &self.listener {
            listener.shutdown();
        }
    }

    /// Convenience method for testing that waits for the predicate to hold
    /// true for the cluster's members.
    pub async fn wait_for_members<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(&GridMembership) -> bool,
    {
        use tokio::time::timeout;

        timeout(
            timeout_after,
            self.member_change_watcher()
                .skip_while(|members| !predicate(members))
                .next(),
        )
        .await?;
        Ok(())
    }
}

/// Applies transport membership events to the shared membership view.
///
/// Sessions can exist in duplicate (both sides dialing each other), so
/// members are refcounted and only dropped once their last session dies.
async fn run_membership(
    me: GridMember,
    events: flume::Receiver<PeerEvent>,
    members_tx: watch::Sender<GridMembership>,
    peers: LivePeerSet,
    network: PeerNetwork,
    statistics: GridStatistics,
    stop: Arc<AtomicBool>,
) {
    let mut sessions: HashMap<ClusterAddr, usize> = HashMap::new();
    let mut members = GridMembership::from_iter([(me.addr.clone(), me.clone())]);

    while let Ok(event) = events.recv_async().await {
        if stop.load(Ordering::Relaxed) {
            debug!("Received a stop signal. Stopping.");
            return;
        }

        match event {
            PeerEvent::Joined(member) => {
                if member.addr == me.addr {
                    continue;
                }
                *sessions.entry(member.addr.clone()).or_default() += 1;

                info!(
                    self_node_id = %me.instance_id,
                    target_node_id = %member.instance_id,
                    target_addr = %member.addr,
                    role = %member.role,
                    "Node has connected to the cluster."
                );

                if member.role == NodeRole::Member {
                    // The live network config learns about members from the
                    // transport as well as from the reconciler.
                    peers.insert(member.addr.clone());
                }
                members.insert(member.addr.clone(), member);
            },
            PeerEvent::Left(addr) => {
                if addr == me.addr {
                    continue;
                }

                let remaining = match sessions.get_mut(&addr) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count
                    },
                    None => continue,
                };
                if remaining > 0 {
                    continue;
                }
                sessions.remove(&addr);

                if members.remove(&addr).is_some() {
                    info!(
                        self_node_id = %me.instance_id,
                        target_addr = %addr,
                        "Node is no longer part of cluster."
                    );
                    statistics.num_dead_members.fetch_add(1, Ordering::Relaxed);
                    // The transport's failure detector is the only thing
                    // allowed to shrink the live network configuration; the
                    // reconciler re-adds the peer if it is still registered.
                    peers.remove(&addr);
                    network.disconnect(&addr);
                }
            },
        }

        statistics.num_live_members.store(
            members.values().filter(|m| m.role == NodeRole::Member).count() as u64,
            Ordering::Relaxed,
        );
        statistics.num_connected_clients.store(
            members.values().filter(|m| m.role == NodeRole::Client).count() as u64,
            Ordering::Relaxed,
        );

        if members_tx.send(members.clone()).is_err() {
            // The node handle has been dropped.
            debug!("Failed to update members list. Stopping.");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plan::StabilityProfile;
    use crate::settings::GridSettings;
    use crate::topology::{ActiveFlags, DeploymentTopology, JobStore};

    fn test_node(flags: ActiveFlags, registered: bool) -> (GridNode, flume::Sender<PeerEvent>) {
        let _ = tracing_subscriber::fmt::try_init();

        let topology = DeploymentTopology::classify(flags, JobStore::InMemoryGrid);
        let settings = GridSettings::new("node-test");
        let plan = Arc::new(ClusterPlan::assemble(&settings, &topology, registered).unwrap());

        let me = GridMember::new(
            plan.instance_name.clone(),
            ClusterAddr::new("10.0.0.1", plan.port),
            plan.role,
            None,
        );
        let (events_tx, events_rx) = flume::bounded(16);
        let network = PeerNetwork::new(me.clone(), StabilityProfile::default(), events_tx.clone());

        let node = GridNode::start(
            me,
            plan,
            RegistryHandle::unregistered(),
            LivePeerSet::default(),
            network,
            None,
            events_rx,
            GridStatistics::default(),
        );
        (node, events_tx)
    }

    fn member_flags() -> ActiveFlags {
        ActiveFlags {
            core: true,
            local_ci: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn registry_less_single_node_stays_quorate() {
        let (node, _events_tx) = test_node(member_flags(), false);

        assert!(node.plan().quorum.is_none());
        assert!(node.is_quorate());

        // Still quorate after the startup grace period: a single-node
        // deployment carries no minimum-size policy it could never satisfy.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(node.is_quorate());
    }

    #[tokio::test]
    async fn quorum_holds_during_grace_then_tracks_membership() {
        let (node, events_tx) = test_node(member_flags(), true);

        // Alone, but inside the startup grace period.
        assert!(node.is_quorate());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!node.is_quorate());

        let peer = GridMember::new(
            "node-2",
            ClusterAddr::new("10.0.0.2", node.plan().port),
            NodeRole::Member,
            None,
        );
        events_tx.send_async(PeerEvent::Joined(peer)).await.unwrap();
        node.wait_for_members(|members| members.len() == 2, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(node.is_quorate());
    }

    #[tokio::test]
    async fn client_sessions_never_enter_the_member_sets() {
        let (node, events_tx) = test_node(member_flags(), true);

        let client = GridMember::new(
            "agent-1",
            ClusterAddr::new("10.0.0.3", node.plan().port),
            NodeRole::Client,
            None,
        );
        events_tx
            .send_async(PeerEvent::Joined(client.clone()))
            .await
            .unwrap();
        node.wait_for_members(|members| members.len() == 2, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(node.live_member_addrs().len(), 1);
        assert!(!node.peer_addrs().contains(&client.addr));
        assert_eq!(node.statistics().num_connected_clients(), 1);
    }

    #[tokio::test]
    async fn duplicate_sessions_are_refcounted() {
        let (node, events_tx) = test_node(member_flags(), true);

        let peer = GridMember::new(
            "node-2",
            ClusterAddr::new("10.0.0.2", node.plan().port),
            NodeRole::Member,
            None,
        );
        // Both sides dialed each other: two sessions, one membership entry.
        events_tx
            .send_async(PeerEvent::Joined(peer.clone()))
            .await
            .unwrap();
        events_tx
            .send_async(PeerEvent::Joined(peer.clone()))
            .await
            .unwrap();
        node.wait_for_members(|members| members.len() == 2, Duration::from_secs(5))
            .await
            .unwrap();

        // Losing one of the two sessions does not drop the member.
        events_tx
            .send_async(PeerEvent::Left(peer.addr.clone()))
            .await
            .unwrap();
        node.wait_for_members(
            |members| members.len() == 2,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        events_tx
            .send_async(PeerEvent::Left(peer.addr.clone()))
            .await
            .unwrap();
        node.wait_for_members(|members| members.len() == 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(node.statistics().num_dead_members(), 1);
    }

    #[tokio::test]
    async fn dead_member_leaves_the_peer_set() {
        let (node, events_tx) = test_node(member_flags(), true);

        let peer = GridMember::new(
            "node-2",
            ClusterAddr::new("10.0.0.2", node.plan().port),
            NodeRole::Member,
            None,
        );
        events_tx
            .send_async(PeerEvent::Joined(peer.clone()))
            .await
            .unwrap();
        node.wait_for_members(|members| members.len() == 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(node.peer_addrs().contains(&peer.addr));

        events_tx
            .send_async(PeerEvent::Left(peer.addr.clone()))
            .await
            .unwrap();
        node.wait_for_members(|members| members.len() == 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!node.peer_addrs().contains(&peer.addr));
    }

    #[tokio::test]
    async fn shared_queue_enforces_one_job_type() {
        let (node, _events_tx) = test_node(member_flags(), true);

        let queue = node
            .shared_queue::<u32>(Arc::new(|a, b| a.cmp(b)))
            .unwrap();
        queue.offer(7);

        let again = node.shared_queue::<u32>(Arc::new(|a, b| a.cmp(b))).unwrap();
        assert_eq!(again.poll(), Some(7));

        let conflict = node.shared_queue::<String>(Arc::new(|a, b| a.cmp(b)));
        assert!(matches!(conflict, Err(GridError::QueueTypeConflict(_))));
    }

    #[tokio::test]
    async fn non_queue_bearing_roles_have_no_queue() {
        let (node, _events_tx) = test_node(
            ActiveFlags {
                core: true,
                ..Default::default()
            },
            true,
        );

        let result = node.shared_queue::<u32>(Arc::new(|a, b| a.cmp(b)));
        assert!(matches!(result, Err(GridError::QueueNotConfigured)));
    }
}
