use std::time::Duration;

use rand::Rng;

use crate::error::GridError;
use crate::settings::GridSettings;
use crate::topology::{ClusterActivation, DeploymentTopology, NodeRole};

/// Name of the shared build-job priority queue.
pub static JOB_QUEUE_NAME: &str = "build-job-queue";
/// Name of the split-brain protection policy.
pub static QUORUM_POLICY_NAME: &str = "gridlink-split-brain-protection";

const QUORUM_FIRST_EVAL_DELAY: Duration = if cfg!(test) {
    Duration::from_millis(300)
} else {
    Duration::from_secs(30)
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least-recently-used entry once the size bound is hit.
    Lru,
    /// Never evict on size; lifetime bounds still apply.
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxSizePolicy {
    /// Bound the entry count held by each node.
    PerNodeEntries(usize),
    Unbounded,
}

#[derive(Clone, Debug)]
/// Eviction, backup and lifetime policy for one named map (or a
/// wildcard-matched family of maps).
pub struct MapPolicy {
    pub name_pattern: String,
    pub eviction: EvictionPolicy,
    pub max_size: MaxSizePolicy,
    pub backup_count: u16,
    pub ttl: Option<Duration>,
}

impl MapPolicy {
    /// Whether this policy applies to the given map name. `*` in the pattern
    /// matches any run of characters.
    pub fn matches(&self, name: &str) -> bool {
        wildcard_match(&self.name_pattern, name)
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = segments.split_first().expect("split never yields zero segments");
    let (last, middle) = rest.split_last().expect("pattern contains at least one `*`");

    let Some(mut remaining) = name.strip_prefix(first) else {
        return false;
    };
    for segment in middle {
        match remaining.find(segment) {
            Some(idx) => remaining = &remaining[idx + segment.len()..],
            None => return false,
        }
    }

    // The final segment anchors at the end unless the pattern ends with `*`.
    last.is_empty() || remaining.ends_with(last)
}

#[derive(Clone, Debug)]
/// Configuration of the shared priority queue hosted by queue-bearing nodes.
pub struct QueueSpec {
    pub name: String,
    pub backup_count: u16,
}

#[derive(Clone, Debug)]
/// Split-brain protection: the minimum number of reachable members below
/// which the cluster refuses to consider itself whole.
pub struct QuorumPolicy {
    pub name: String,
    pub minimum_cluster_size: usize,
    /// Grace period after startup before the first quorum evaluation, so
    /// normal bootstrap convergence isn't mistaken for a partition.
    pub first_eval_delay: Duration,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            name: QUORUM_POLICY_NAME.to_string(),
            minimum_cluster_size: 2,
            first_eval_delay: QUORUM_FIRST_EVAL_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug)]
/// Failure-detection tuning of the grid transport.
pub struct StabilityProfile {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for StabilityProfile {
    fn default() -> Self {
        if cfg!(test) {
            Self {
                heartbeat_interval: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_millis(1500),
                connect_timeout: Duration::from_secs(1),
            }
        } else {
            Self {
                heartbeat_interval: Duration::from_secs(5),
                heartbeat_timeout: Duration::from_secs(15),
                connect_timeout: Duration::from_secs(5),
            }
        }
    }
}

#[derive(Clone, Debug)]
/// The immutable configuration a grid node is bootstrapped from.
///
/// Produced exactly once per process; the only cluster state that changes
/// afterwards lives in the separately synchronized live peer set.
pub struct ClusterPlan {
    pub cluster_name: String,
    pub instance_name: String,
    pub role: NodeRole,
    /// The single interface the transport binds to. Never "any".
    pub bind_host: String,
    /// The effective transport port.
    pub port: u16,
    /// Whether the transport prefers the IPv4 stack. Disabled when an
    /// explicit interface is configured so dual-stack hosts work.
    pub prefer_ipv4: bool,
    /// Whether registry-based peer discovery runs at all. Disabled for
    /// isolated test instances.
    pub discovery_enabled: bool,
    pub map_policies: Vec<MapPolicy>,
    pub queue: Option<QueueSpec>,
    pub quorum: Option<QuorumPolicy>,
    pub stability: StabilityProfile,
    pub display_name: Option<String>,
}

impl ClusterPlan {
    /// Assembles the plan for this process.
    ///
    /// `registered` says whether a service registry is configured; without
    /// one the node can only ever be a single-node cluster and binds to
    /// loopback.
    pub fn assemble(
        settings: &GridSettings,
        topology: &DeploymentTopology,
        registered: bool,
    ) -> Result<Self, GridError> {
        let role = topology.role().ok_or(GridError::ClusteringDisabled)?;
        let isolated = topology.activation() == ClusterActivation::TestIsolated;

        if settings.instance_name.is_empty() {
            return Err(GridError::MissingConfig("instance_name"));
        }

        let (cluster_name, port, bind_host, prefer_ipv4) = if isolated {
            // Parallel test runs must never form a cluster with each other
            // or with anything real: randomized cluster name, an OS-assigned
            // ephemeral port (0, resolved at bind time), loopback only.
            let mut rng = rand::thread_rng();
            let cluster_name = format!("test-cluster-{:08x}", rng.gen::<u32>());
            (cluster_name, 0, "127.0.0.1".to_string(), true)
        } else {
            let port = if registered && settings.local_instances {
                settings.http_port.checked_add(settings.port).ok_or(
                    GridError::InvalidConfig {
                        key: "port",
                        value: format!("{} + {}", settings.http_port, settings.port),
                    },
                )?
            } else {
                settings.port
            };

            let cluster_name = if settings.local_instances { "dev" } else { "prod" };

            let (bind_host, prefer_ipv4) = match (&settings.interface, registered) {
                // No registry means no multi-node cluster; stay on loopback.
                (_, false) => ("127.0.0.1".to_string(), true),
                (Some(interface), true) => (interface.clone(), false),
                (None, true) => ("127.0.0.1".to_string(), true),
            };

            (cluster_name.to_string(), port, bind_host, prefer_ipv4)
        };

        let queue = topology.is_queue_bearing().then(|| QueueSpec {
            name: JOB_QUEUE_NAME.to_string(),
            backup_count: settings.backup_count,
        });

        // Clients hold no partitions and are excluded from quorum counting.
        // A registry-less process can only ever be a single-node cluster, so
        // a minimum-size policy would leave it permanently below quorum.
        let quorum = (role == NodeRole::Member && !isolated && registered)
            .then(QuorumPolicy::default);

        Ok(Self {
            cluster_name,
            instance_name: settings.instance_name.clone(),
            role,
            bind_host,
            port,
            prefer_ipv4,
            discovery_enabled: !isolated && registered,
            map_policies: default_map_policies(settings),
            queue,
            quorum,
            stability: StabilityProfile::default(),
            display_name: settings.display_name.clone(),
        })
    }

    /// The policy applying to a named map: first matching entry, or a plain
    /// unbounded policy when nothing matches.
    pub fn policy_for(&self, map_name: &str) -> MapPolicy {
        self.map_policies
            .iter()
            .find(|policy| policy.matches(map_name))
            .cloned()
            .unwrap_or(MapPolicy {
                name_pattern: map_name.to_string(),
                eviction: EvictionPolicy::None,
                max_size: MaxSizePolicy::Unbounded,
                backup_count: 0,
                ttl: None,
            })
    }
}

/// The standard map catalogue: a bounded LRU default, a TTL-carrying map for
/// file-like byte payloads, and a wildcard family for generic domain-object
/// caching.
fn default_map_policies(settings: &GridSettings) -> Vec<MapPolicy> {
    vec![
        MapPolicy {
            name_pattern: "files".to_string(),
            eviction: EvictionPolicy::Lru,
            max_size: MaxSizePolicy::PerNodeEntries(10_000),
            backup_count: settings.backup_count,
            ttl: Some(settings.cache_ttl),
        },
        MapPolicy {
            name_pattern: "domain.*".to_string(),
            eviction: EvictionPolicy::None,
            max_size: MaxSizePolicy::Unbounded,
            backup_count: 0,
            ttl: Some(settings.cache_ttl),
        },
        MapPolicy {
            name_pattern: "default".to_string(),
            eviction: EvictionPolicy::Lru,
            max_size: MaxSizePolicy::PerNodeEntries(100_000),
            backup_count: settings.backup_count,
            ttl: None,
        },
    ]
}
