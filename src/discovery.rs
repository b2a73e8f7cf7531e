use std::collections::BTreeSet;

use tracing::warn;

use crate::addr::{resolve_cluster_address, ClusterAddr};
use crate::error::GridError;
use crate::registry::RegistryHandle;
use crate::topology::NodeRole;

/// Registry-backed peer discovery.
///
/// Turns the raw instance list of the service registry into the set of
/// dialable member addresses: client-role instances are skipped, the local
/// node is excluded, and instances whose advertised address cannot be
/// resolved are dropped with a warning rather than failing the sweep.
#[derive(Clone)]
pub struct RegistryDiscovery {
    registry: RegistryHandle,
    default_port: u16,
    self_addr: Option<ClusterAddr>,
}

impl RegistryDiscovery {
    pub fn new(
        registry: RegistryHandle,
        default_port: u16,
        self_addr: Option<ClusterAddr>,
    ) -> Self {
        Self {
            registry,
            default_port,
            self_addr,
        }
    }

    /// The cluster addresses of every registered `Member`-role instance,
    /// local node excluded.
    ///
    /// Instances without role metadata are included: they predate the role
    /// marker and are members by definition.
    pub async fn discover_members(&self) -> Result<BTreeSet<ClusterAddr>, GridError> {
        let instances = self.registry.list_instances().await?;

        let mut addrs = BTreeSet::new();
        for instance in &instances {
            if instance.role() != NodeRole::Member {
                continue;
            }

            let addr = match resolve_cluster_address(instance, self.default_port) {
                Ok(addr) => addr,
                Err(error) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        error = %error,
                        "Skipping registry instance with unresolvable cluster address."
                    );
                    continue;
                },
            };

            if Some(&addr) == self.self_addr.as_ref() {
                continue;
            }
            addrs.insert(addr);
        }

        Ok(addrs)
    }
}
