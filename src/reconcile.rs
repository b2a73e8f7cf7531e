use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::addr::ClusterAddr;
use crate::discovery::RegistryDiscovery;
use crate::error::GridError;
use crate::net::PeerNetwork;
use crate::node::{GridMembership, GridNode};
use crate::peers::LivePeerSet;
use crate::statistics::GridStatistics;
use crate::topology::NodeRole;

/// Delay between the end of one reconciliation tick and the start of the
/// next. Fixed delay from completion, so ticks never overlap.
pub(crate) const RECONCILE_PERIOD: Duration = if cfg!(test) {
    Duration::from_millis(500)
} else {
    Duration::from_secs(30)
};

pub(crate) const RECONCILE_INITIAL_DELAY: Duration = if cfg!(test) {
    Duration::from_millis(200)
} else {
    Duration::from_secs(10)
};

#[derive(Debug, Default)]
/// What one reconciliation tick did.
pub struct TickReport {
    /// Peers newly added to the live network configuration.
    pub added: Vec<ClusterAddr>,
    /// Live members the registry no longer lists: possibly stale/zombie
    /// nodes that crashed without deregistering. Logged, never evicted.
    pub suspected_stale: Vec<ClusterAddr>,
}

/// The periodic diff-and-converge loop between live cluster membership and
/// registry-reported membership.
///
/// This is the core liveness mechanism of a dynamically scaled fleet: it is
/// idempotent and re-run continuously, which lets it tolerate registry
/// staleness, out-of-order node startup and asymmetric visibility.
pub struct Reconciler {
    role: NodeRole,
    self_addr: ClusterAddr,
    discovery: RegistryDiscovery,
    peers: LivePeerSet,
    network: PeerNetwork,
    live_members: watch::Receiver<GridMembership>,
    statistics: GridStatistics,
}

impl Reconciler {
    /// Builds a reconciler over the node's registry and live membership.
    pub fn from_node(node: &GridNode) -> Self {
        let me = node.me();
        Self {
            role: me.role,
            self_addr: me.addr.clone(),
            discovery: RegistryDiscovery::new(
                node.registry().clone(),
                node.plan().port,
                Some(me.addr.clone()),
            ),
            peers: node.peers().clone(),
            network: node.network().clone(),
            live_members: node.members_watcher(),
            statistics: node.statistics(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        role: NodeRole,
        self_addr: ClusterAddr,
        discovery: RegistryDiscovery,
        peers: LivePeerSet,
        network: PeerNetwork,
        live_members: watch::Receiver<GridMembership>,
        statistics: GridStatistics,
    ) -> Self {
        Self {
            role,
            self_addr,
            discovery,
            peers,
            network,
            live_members,
            statistics,
        }
    }

    /// Runs one reconciliation tick.
    ///
    /// Clients do not participate in peer reconciliation: for them the tick
    /// is a no-op regardless of registry or cluster state.
    pub async fn tick(&self) -> Result<TickReport, GridError> {
        if self.role != NodeRole::Member {
            return Ok(TickReport::default());
        }

        let live: BTreeSet<ClusterAddr> = self
            .live_members
            .borrow()
            .values()
            .filter(|member| member.role == NodeRole::Member)
            .map(|member| member.addr.clone())
            .collect();

        let registered = self.discovery.discover_members().await?;

        let mut report = TickReport::default();

        // Newly launched nodes get discovered by already-running nodes here,
        // without a restart.
        for addr in registered.difference(&live) {
            if self.peers.insert(addr.clone()) {
                self.statistics.num_peers_added.fetch_add(1, Ordering::Relaxed);
                self.network.connect(addr.clone());
                debug!(addr = %addr, "Added newly registered peer to the live cluster.");
                report.added.push(addr.clone());
            }
        }

        // Members the registry no longer lists are only ever flagged;
        // eviction of dead nodes belongs to the transport's failure
        // detector.
        for addr in live.difference(&registered) {
            if *addr == self.self_addr {
                continue;
            }
            warn!(
                addr = %addr,
                "Live cluster member is not listed in the service registry; \
                 it may be a stale node that crashed without deregistering."
            );
            self.statistics
                .num_stale_suspects
                .fetch_add(1, Ordering::Relaxed);
            report.suspected_stale.push(addr.clone());
        }

        self.statistics
            .num_reconcile_ticks
            .fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }
}

/// Spawns the periodic reconciliation loop.
///
/// Tick failures are contained here: a failed tick is logged and skipped,
/// and a later cycle retries. Nothing propagates out of the periodic task.
pub(crate) fn spawn_reconciler(reconciler: Reconciler, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::time::sleep(RECONCILE_INITIAL_DELAY).await;
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }

            match reconciler.tick().await {
                Ok(report) => {
                    if !report.added.is_empty() || !report.suspected_stale.is_empty() {
                        debug!(
                            added = report.added.len(),
                            suspected_stale = report.suspected_stale.len(),
                            "Reconciliation tick converged membership."
                        );
                    }
                },
                Err(error) => {
                    warn!(
                        error = %error,
                        "Reconciliation tick failed; skipping this cycle."
                    );
                },
            }

            tokio::time::sleep(RECONCILE_PERIOD).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::GridMember;
    use crate::plan::StabilityProfile;
    use crate::registry::{RegistryHandle, SharedRegistry, METADATA_BIND_PORT, METADATA_ROLE};

    const DEFAULT_PORT: u16 = 5701;

    struct Fixture {
        shared: SharedRegistry,
        reconciler: Reconciler,
        peers: LivePeerSet,
        members_tx: watch::Sender<GridMembership>,
        statistics: GridStatistics,
    }

    fn fixture(role: NodeRole) -> Fixture {
        let _ = tracing_subscriber::fmt::try_init();

        let shared = SharedRegistry::default();
        let self_addr = ClusterAddr::new("10.0.0.1", DEFAULT_PORT);
        let me = GridMember::new("node-self", self_addr.clone(), role, None);

        let registry = RegistryHandle::new(
            "grid",
            Arc::new(shared.register("grid", "10.0.0.1", 8080)),
        );
        let discovery = RegistryDiscovery::new(registry, DEFAULT_PORT, Some(self_addr.clone()));
        let peers = LivePeerSet::default();
        let (events_tx, _events_rx) = flume::bounded(16);
        let network = PeerNetwork::new(me.clone(), StabilityProfile::default(), events_tx);

        let initial = GridMembership::from_iter([(self_addr.clone(), me)]);
        let (members_tx, members_rx) = watch::channel(initial);

        let statistics = GridStatistics::default();
        let reconciler = Reconciler::for_test(
            role,
            self_addr,
            discovery,
            peers.clone(),
            network,
            members_rx,
            statistics.clone(),
        );

        Fixture {
            shared,
            reconciler,
            peers,
            members_tx,
            statistics,
        }
    }

    async fn publish(
        shared: &SharedRegistry,
        host: &str,
        role: Option<&str>,
        bind_port: Option<&str>,
    ) {
        let registry = shared.register("grid", host, 8080);
        if let Some(role) = role {
            crate::registry::ServiceRegistry::set_metadata(&registry, METADATA_ROLE, role)
                .await
                .unwrap();
        }
        if let Some(port) = bind_port {
            crate::registry::ServiceRegistry::set_metadata(&registry, METADATA_BIND_PORT, port)
                .await
                .unwrap();
        }
        registry.heartbeat();
    }

    #[tokio::test]
    async fn adds_all_missing_members_and_warns_about_nothing() {
        let fx = fixture(NodeRole::Member);
        publish(&fx.shared, "10.0.0.2", Some("member"), None).await;
        publish(&fx.shared, "10.0.0.3", Some("member"), None).await;

        let report = fx.reconciler.tick().await.unwrap();

        assert_eq!(report.added.len(), 2);
        assert!(report.suspected_stale.is_empty());
        assert_eq!(
            fx.peers.snapshot(),
            BTreeSet::from_iter([
                ClusterAddr::new("10.0.0.2", DEFAULT_PORT),
                ClusterAddr::new("10.0.0.3", DEFAULT_PORT),
            ])
        );
        assert_eq!(fx.statistics.num_peers_added(), 2);
        assert_eq!(fx.statistics.num_stale_suspects(), 0);
    }

    #[tokio::test]
    async fn never_adds_itself() {
        let fx = fixture(NodeRole::Member);
        // The local node's own registration resolves to its own address.
        publish(&fx.shared, "10.0.0.1", Some("member"), None).await;

        let report = fx.reconciler.tick().await.unwrap();
        assert!(report.added.is_empty());
        assert!(fx.peers.is_empty());
    }

    #[tokio::test]
    async fn warns_once_per_stale_member_without_evicting() {
        let fx = fixture(NodeRole::Member);

        let ghost = ClusterAddr::new("10.0.0.9", DEFAULT_PORT);
        let mut members = fx.members_tx.borrow().clone();
        members.insert(
            ghost.clone(),
            GridMember::new("node-ghost", ghost.clone(), NodeRole::Member, None),
        );
        fx.members_tx.send(members).unwrap();

        let report = fx.reconciler.tick().await.unwrap();

        assert!(report.added.is_empty());
        assert_eq!(report.suspected_stale, vec![ghost]);
        assert_eq!(fx.statistics.num_stale_suspects(), 1);
        // The stale member stays in the live view; eviction is the failure
        // detector's job.
        assert_eq!(fx.members_tx.borrow().len(), 2);
    }

    #[tokio::test]
    async fn self_is_never_a_stale_suspect() {
        let fx = fixture(NodeRole::Member);
        // Registry lists nothing at all, yet the local node is live.
        fx.shared.deregister("grid", "10.0.0.1:8080");

        let report = fx.reconciler.tick().await.unwrap();
        assert!(report.suspected_stale.is_empty());
    }

    #[tokio::test]
    async fn tick_is_idempotent_for_the_same_registry_snapshot() {
        let fx = fixture(NodeRole::Member);
        publish(&fx.shared, "10.0.0.2", Some("member"), None).await;

        let first = fx.reconciler.tick().await.unwrap();
        let after_first = fx.peers.snapshot();
        let second = fx.reconciler.tick().await.unwrap();

        assert_eq!(first.added.len(), 1);
        assert!(second.added.is_empty());
        assert_eq!(fx.peers.snapshot(), after_first);
    }

    #[tokio::test]
    async fn clients_and_legacy_instances_are_filtered_correctly() {
        let fx = fixture(NodeRole::Member);
        // No role metadata: legacy member, included for compatibility.
        publish(&fx.shared, "10.0.0.2", None, None).await;
        // Explicit client: never a reconciliation target.
        publish(&fx.shared, "10.0.0.3", Some("client"), None).await;

        let report = fx.reconciler.tick().await.unwrap();
        assert_eq!(
            report.added,
            vec![ClusterAddr::new("10.0.0.2", DEFAULT_PORT)]
        );
    }

    #[tokio::test]
    async fn malformed_instance_is_dropped_but_others_proceed() {
        let fx = fixture(NodeRole::Member);
        publish(&fx.shared, "10.0.0.2", Some("member"), Some("not-a-port")).await;
        publish(&fx.shared, "10.0.0.3", Some("member"), Some("9080")).await;

        let report = fx.reconciler.tick().await.unwrap();
        assert_eq!(report.added, vec![ClusterAddr::new("10.0.0.3", 9080)]);
    }

    #[tokio::test]
    async fn client_role_tick_is_a_no_op() {
        let fx = fixture(NodeRole::Client);
        publish(&fx.shared, "10.0.0.2", Some("member"), None).await;

        let report = fx.reconciler.tick().await.unwrap();
        assert!(report.added.is_empty());
        assert!(report.suspected_stale.is_empty());
        assert!(fx.peers.is_empty());
        assert_eq!(fx.statistics.num_reconcile_ticks(), 0);
    }

    #[tokio::test]
    async fn unregistered_process_reconciles_quietly() {
        let _ = tracing_subscriber::fmt::try_init();

        let self_addr = ClusterAddr::new("127.0.0.1", DEFAULT_PORT);
        let me = GridMember::new("solo", self_addr.clone(), NodeRole::Member, None);
        let (events_tx, _events_rx) = flume::bounded(16);
        let (members_tx, members_rx) =
            watch::channel(GridMembership::from_iter([(self_addr.clone(), me.clone())]));
        let _keep = members_tx;

        let reconciler = Reconciler::for_test(
            NodeRole::Member,
            self_addr,
            RegistryDiscovery::new(RegistryHandle::unregistered(), DEFAULT_PORT, None),
            LivePeerSet::default(),
            PeerNetwork::new(me, StabilityProfile::default(), events_tx),
            members_rx,
            GridStatistics::default(),
        );

        let report = reconciler.tick().await.unwrap();
        assert!(report.added.is_empty());
        assert!(report.suspected_stale.is_empty());
    }
}
