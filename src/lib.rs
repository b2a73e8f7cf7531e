//! Registry-driven cluster coordination for build grids.
//!
//! A process classifies itself from its deployment profile, assembles an
//! immutable [`ClusterPlan`], binds the grid transport to one exclusive
//! interface and joins the cluster it finds through the service registry.
//! Members then run a periodic [`Reconciler`] that diffs the registry's view
//! of the fleet against the live cluster and adds any newly registered peer,
//! so the cluster follows dynamic scaling without restarts.

mod addr;
mod codec;
mod discovery;
mod error;
mod map;
mod net;
mod node;
mod peers;
mod plan;
mod queue;
mod reconcile;
mod registry;
mod settings;
mod statistics;
mod topology;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use addr::{format_for_cluster, is_self, normalize_host, resolve_cluster_address, ClusterAddr};
pub use codec::{BinaryCodec, PathCodec};
pub use discovery::RegistryDiscovery;
pub use error::GridError;
pub use map::GridMap;
use net::{GridListener, PeerNetwork};
pub use node::{GridMember, GridMembership, GridNode};
pub use peers::LivePeerSet;
pub use plan::{
    ClusterPlan,
    EvictionPolicy,
    MapPolicy,
    MaxSizePolicy,
    QueueSpec,
    QuorumPolicy,
    StabilityProfile,
    JOB_QUEUE_NAME,
    QUORUM_POLICY_NAME,
};
pub use queue::{PriorityComparator, SharedQueue};
pub use reconcile::{Reconciler, TickReport};
use reconcile::{spawn_reconciler, RECONCILE_PERIOD};
pub use registry::{
    InMemoryRegistry,
    RegistryHandle,
    ServiceInstance,
    ServiceRegistry,
    SharedRegistry,
    METADATA_BIND_HOST,
    METADATA_BIND_PORT,
    METADATA_ROLE,
};
pub use settings::{GridSettings, DEFAULT_CLUSTER_PORT};
pub use statistics::GridStatistics;
pub use topology::{
    ActiveFlags,
    ClusterActivation,
    DeploymentTopology,
    JobStore,
    NodeRole,
};
use tracing::{info, warn};

/// Build a grid node using the provided settings and deployment topology.
pub struct GridBuilder {
    settings: GridSettings,
    topology: DeploymentTopology,
    registry: RegistryHandle,
}

impl GridBuilder {
    /// Create a new node builder.
    ///
    /// Without [`with_registry`](Self::with_registry) the node runs as a
    /// single-node cluster bound to loopback.
    pub fn new(settings: GridSettings, topology: DeploymentTopology) -> Self {
        Self {
            settings,
            topology,
            registry: RegistryHandle::unregistered(),
        }
    }

    /// Attach the service registry the node discovers its peers through and
    /// publishes itself to.
    pub fn with_registry(mut self, registry: RegistryHandle) -> Self {
        self.registry = registry;
        self
    }

    /// Starts the grid node and joins the cluster.
    ///
    /// Members bind the transport to their exclusive interface, publish the
    /// bind address to the registry, seed their peer set from the registered
    /// members and start the periodic reconciler. Clients skip the listener
    /// and the reconciler and only dial the members they discover.
    ///
    /// Fails fast when the deployment profile disables clustering or the
    /// configured interface cannot be bound.
    pub async fn connect(self) -> Result<GridNode, GridError> {
        let plan = Arc::new(ClusterPlan::assemble(
            &self.settings,
            &self.topology,
            self.registry.is_registered(),
        )?);

        let statistics = GridStatistics::default();
        let peers = LivePeerSet::default();
        let (events_tx, events_rx) = flume::bounded(128);

        // Binding is exclusive to one interface and must fail startup when
        // the interface is unavailable, never fall back to wildcard.
        let mut listener = match plan.role {
            NodeRole::Member => Some(GridListener::bind(&plan.bind_host, plan.port).await?),
            NodeRole::Client => None,
        };
        // Isolated test instances plan port 0, so the effective port is the
        // listener's, not the plan's.
        let advertised_port = listener
            .as_ref()
            .map(|l| l.local_port())
            .unwrap_or(plan.port);

        // Display name falls back to the registry instance id when the
        // settings carry none.
        let display_name = plan.display_name.clone().or_else(|| {
            self.registry
                .local_instance()
                .map(|instance| instance.instance_id)
        });
        let me = GridMember::new(
            plan.instance_name.clone(),
            ClusterAddr::new(&plan.bind_host, advertised_port),
            plan.role,
            display_name,
        );

        if let Some(listener) = &mut listener {
            listener.serve(me.clone(), plan.stability, events_tx.clone());
        }
        let network = PeerNetwork::new(me.clone(), plan.stability, events_tx);

        if plan.discovery_enabled {
            // All three keys go out together, and before any peer seeding,
            // so other nodes never observe a half-registered instance.
            self.registry
                .register_bind_address(plan.role, &plan.bind_host, advertised_port)
                .await?;
        }

        let node = GridNode::start(
            me.clone(),
            plan.clone(),
            self.registry.clone(),
            peers,
            network,
            listener,
            events_rx,
            statistics,
        );

        if plan.discovery_enabled {
            let discovery = RegistryDiscovery::new(
                self.registry.clone(),
                plan.port,
                Some(me.addr.clone()),
            );
            seed_from_registry(&node, &discovery).await;

            match plan.role {
                NodeRole::Member => {
                    if self.topology.reconciler_enabled() {
                        spawn_reconciler(Reconciler::from_node(&node), node.stop_flag());
                        spawn_ready_reconcile(Reconciler::from_node(&node), node.ready_signal());
                    }
                },
                NodeRole::Client => {
                    spawn_client_discovery(
                        discovery,
                        node.network().clone(),
                        node.ready_signal(),
                        node.stop_flag(),
                    );
                },
            }
        }

        info!(
            instance_name = %plan.instance_name,
            cluster_name = %plan.cluster_name,
            role = %plan.role,
            bind_addr = %me.addr,
            "Grid cluster connected."
        );

        Ok(node)
    }
}

/// Dials every member currently listed in the registry.
///
/// A best-effort pass: a registry outage here only delays discovery until
/// the reconciler's next tick.
async fn seed_from_registry(node: &GridNode, discovery: &RegistryDiscovery) {
    let seeds = match discovery.discover_members().await {
        Ok(seeds) => seeds,
        Err(error) => {
            warn!(
                error = %error,
                "Initial peer discovery failed; relying on reconciliation."
            );
            return;
        },
    };

    for addr in seeds {
        match node.me().role {
            NodeRole::Member => {
                node.add_peer(addr);
            },
            NodeRole::Client => node.network().connect(addr),
        }
    }
}

/// Runs one out-of-schedule reconciliation as soon as the surrounding
/// application signals it has fully started, so late registry updates are
/// picked up without waiting for the next periodic tick.
fn spawn_ready_reconcile(reconciler: Reconciler, ready: Arc<tokio::sync::Notify>) {
    tokio::spawn(async move {
        ready.notified().await;
        if let Err(error) = reconciler.tick().await {
            warn!(error = %error, "Post-startup reconciliation failed.");
        }
    });
}

/// The client-side counterpart of the reconciler: periodically re-discovers
/// the member set and keeps sessions open to it. The transport retries each
/// dial with its own backoff, so this only has to feed it addresses.
fn spawn_client_discovery(
    discovery: RegistryDiscovery,
    network: PeerNetwork,
    ready: Arc<tokio::sync::Notify>,
    stop: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut ready = Some(ready);
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }

            match discovery.discover_members().await {
                Ok(members) => {
                    for addr in members {
                        network.connect(addr);
                    }
                },
                Err(error) => {
                    warn!(error = %error, "Client member discovery failed; retrying.");
                },
            }

            // Wake early the first time the application reports ready.
            match ready.take() {
                Some(ready) => {
                    tokio::select! {
                        _ = ready.notified() => {},
                        _ = tokio::time::sleep(RECONCILE_PERIOD) => {},
                    }
                },
                None => tokio::time::sleep(RECONCILE_PERIOD).await,
            }
        }
    });
}
