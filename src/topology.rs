use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// The deployment flags a process was started with.
///
/// These mirror the deployment profiles of the wider platform: a stateless
/// `core` tier, an elastic `build_agent` tier, and the automated-test
/// variants which must never form a real cluster.
pub struct ActiveFlags {
    pub core: bool,
    pub build_agent: bool,
    pub local_ci: bool,
    pub test: bool,
    pub test_build_agent: bool,
    pub test_independent: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Which backing store the build-job subsystem is configured with.
///
/// Build agents using an external store skip the coordination layer
/// entirely; only the in-memory grid option makes them part of the cluster.
pub enum JobStore {
    #[default]
    InMemoryGrid,
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
/// The role a process plays in the cluster.
///
/// Decided once at startup and never flipped at runtime.
pub enum NodeRole {
    /// Holds data partitions, participates in backups and quorum counting.
    Member,
    /// Connects to the cluster for data access but holds no partitions and
    /// is excluded from quorum counting.
    Client,
}

impl NodeRole {
    /// The metadata value written to the service registry for this role.
    pub fn metadata_value(&self) -> &'static str {
        match self {
            NodeRole::Member => "member",
            NodeRole::Client => "client",
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metadata_value())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How the coordination layer runs in this process, if at all.
pub enum ClusterActivation {
    /// The topology does not run the coordination layer.
    Disabled,
    /// Automated-test run: a fully isolated single member with a randomized
    /// cluster name and port, every discovery mechanism disabled.
    TestIsolated,
    /// Full cluster member.
    Member,
    /// Lite/client node connecting outward only.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The single topology value the rest of the crate branches on.
///
/// Computed once at startup from the active deployment flags and the job
/// data-store choice, instead of re-deriving profile combinations ad hoc at
/// every call site.
pub struct DeploymentTopology {
    flags: ActiveFlags,
    job_store: JobStore,
    activation: ClusterActivation,
}

impl DeploymentTopology {
    pub fn classify(flags: ActiveFlags, job_store: JobStore) -> Self {
        let activation = Self::activation_for(flags, job_store);
        Self {
            flags,
            job_store,
            activation,
        }
    }

    fn activation_for(flags: ActiveFlags, job_store: JobStore) -> ClusterActivation {
        let eligible = flags.core
            || (flags.build_agent && job_store == JobStore::InMemoryGrid);
        if !eligible {
            return ClusterActivation::Disabled;
        }

        // The test-independent variant intentionally exercises real
        // multi-node behavior and must not be isolated.
        if flags.test && !flags.test_independent {
            return ClusterActivation::TestIsolated;
        }

        if flags.build_agent && !flags.core && !flags.test_build_agent {
            return ClusterActivation::Client;
        }

        ClusterActivation::Member
    }

    pub fn activation(&self) -> ClusterActivation {
        self.activation
    }

    pub fn role(&self) -> Option<NodeRole> {
        match self.activation {
            ClusterActivation::Disabled => None,
            ClusterActivation::Client => Some(NodeRole::Client),
            ClusterActivation::Member | ClusterActivation::TestIsolated => {
                Some(NodeRole::Member)
            },
        }
    }

    /// Whether this process wires up the shared build-job queue: core nodes
    /// running the integrated CI, and build agents on the in-memory-grid
    /// store (which pull jobs from it).
    pub fn is_queue_bearing(&self) -> bool {
        self.activation != ClusterActivation::Disabled
            && (self.flags.local_ci
                || (self.flags.build_agent && self.job_store == JobStore::InMemoryGrid))
    }

    /// Whether the periodic membership reconciler runs in this process.
    ///
    /// Clients do not participate in peer reconciliation, and isolated test
    /// instances have nothing to reconcile against.
    pub fn reconciler_enabled(&self) -> bool {
        self.activation == ClusterActivation::Member
    }

    pub fn flags(&self) -> ActiveFlags {
        self.flags
    }

    pub fn job_store(&self) -> JobStore {
        self.job_store
    }
}
