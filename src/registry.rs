use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::GridError;
use crate::topology::NodeRole;

/// Metadata key marking an instance as a grid member or client.
pub static METADATA_ROLE: &str = "grid.member-type";
/// Metadata key carrying the host the grid transport is bound to.
pub static METADATA_BIND_HOST: &str = "grid.bind-host";
/// Metadata key carrying the port the grid transport is bound to.
pub static METADATA_BIND_PORT: &str = "grid.bind-port";

#[derive(Clone, Debug, PartialEq, Eq)]
/// One running process as seen through the external service registry.
///
/// Owned by the registry, not by the coordination layer. The metadata map is
/// mutable and eventually consistent; peers may observe it one heartbeat
/// late.
pub struct ServiceInstance {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(instance_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The role advertised by this instance.
    ///
    /// Instances with no role metadata are treated as legacy members for
    /// backward compatibility with nodes that predate the role marker.
    pub fn role(&self) -> NodeRole {
        match self.metadata(METADATA_ROLE) {
            Some(value) if value == NodeRole::Client.metadata_value() => NodeRole::Client,
            _ => NodeRole::Member,
        }
    }
}

#[async_trait]
/// The external service-discovery system, as consumed by this crate.
///
/// Any registry exposing "list instances by service id", "read/write
/// key-value metadata on my instance" and "optional immediate re-publish"
/// satisfies this interface.
pub trait ServiceRegistry: Send + Sync + 'static {
    /// All currently registered instances of the given service.
    async fn list_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>, GridError>;

    /// Updates a metadata key on the local registration.
    ///
    /// The new value propagates to peers with the next heartbeat unless
    /// [`publish_now`](Self::publish_now) is called.
    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), GridError>;

    /// Attempts an out-of-band re-publish of the local registration so peers
    /// see metadata changes before the next scheduled heartbeat.
    async fn publish_now(&self) -> Result<(), GridError>;

    /// The local process's own registration, if any.
    fn local_instance(&self) -> Option<ServiceInstance>;
}

#[derive(Clone)]
/// Thin handle over an optional [`ServiceRegistry`].
///
/// A process running outside a clustered deployment has no registration at
/// all; every caller must treat that as a normal, non-error condition. This
/// wrapper folds the absent case into empty results and no-op writes so the
/// rest of the crate never has to branch on it.
pub struct RegistryHandle {
    service_id: String,
    inner: Option<Arc<dyn ServiceRegistry>>,
}

impl RegistryHandle {
    pub fn new(service_id: impl Into<String>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            service_id: service_id.into(),
            inner: Some(registry),
        }
    }

    /// A handle for processes with no registration configured.
    pub fn unregistered() -> Self {
        Self {
            service_id: String::new(),
            inner: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.inner.is_some()
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Lists the registered instances of this service.
    ///
    /// Returns an empty list when no registration is configured.
    pub async fn list_instances(&self) -> Result<Vec<ServiceInstance>, GridError> {
        match &self.inner {
            Some(registry) => registry.list_instances(&self.service_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn local_instance(&self) -> Option<ServiceInstance> {
        self.inner.as_ref().and_then(|r| r.local_instance())
    }

    /// Writes the role marker and bind host/port metadata in one go, then
    /// attempts an immediate re-publish.
    ///
    /// The three keys must be written together before peer seeding: other
    /// nodes' discovery depends on all of them being present and consistent.
    /// A failed re-publish is logged and left to the next heartbeat; it must
    /// never fail startup.
    pub async fn register_bind_address(
        &self,
        role: NodeRole,
        host: &str,
        port: u16,
    ) -> Result<(), GridError> {
        let Some(registry) = &self.inner else {
            return Ok(());
        };

        registry
            .set_metadata(METADATA_ROLE, role.metadata_value())
            .await?;
        registry.set_metadata(METADATA_BIND_HOST, host).await?;
        registry
            .set_metadata(METADATA_BIND_PORT, &port.to_string())
            .await?;

        debug!(
            role = %role,
            bind_host = %host,
            bind_port = port,
            "Registered grid bind address in service registry."
        );

        self.publish_now().await;
        Ok(())
    }

    /// Attempts an immediate re-publish, falling back to heartbeat
    /// propagation on failure.
    pub async fn publish_now(&self) {
        let Some(registry) = &self.inner else {
            return;
        };

        if let Err(error) = registry.publish_now().await {
            warn!(
                error = %error,
                "Immediate registry re-publish failed; metadata will \
                 propagate with the next heartbeat."
            );
        }
    }
}

/// Shared state of an [`InMemoryRegistry`] cluster: one of these stands in
/// for the registry server, and every process in the test or single-host
/// deployment registers against the same instance.
#[derive(Clone, Default)]
pub struct SharedRegistry {
    services: Arc<RwLock<HashMap<String, BTreeMap<String, ServiceInstance>>>>,
}

impl SharedRegistry {
    /// Registers a new instance and returns the per-process registry client
    /// for it.
    pub fn register(
        &self,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> InMemoryRegistry {
        let service_id = service_id.into();
        let host = host.into();
        let instance_id = format!("{host}:{port}");
        let instance = ServiceInstance::new(instance_id.clone(), host, port);

        self.services
            .write()
            .entry(service_id.clone())
            .or_default()
            .insert(instance_id.clone(), instance.clone());

        InMemoryRegistry {
            shared: self.clone(),
            service_id,
            instance_id,
            local: Arc::new(RwLock::new(instance)),
        }
    }

    /// Removes an instance, as a registry would on deregistration or
    /// heartbeat timeout.
    pub fn deregister(&self, service_id: &str, instance_id: &str) {
        if let Some(instances) = self.services.write().get_mut(service_id) {
            instances.remove(instance_id);
        }
    }
}

/// In-process [`ServiceRegistry`] implementation backed by a
/// [`SharedRegistry`].
///
/// This is the registry used by single-host deployments and by tests; a wire
/// protocol client for a real registry is an external collaborator and lives
/// outside this crate.
#[derive(Clone)]
pub struct InMemoryRegistry {
    shared: SharedRegistry,
    service_id: String,
    instance_id: String,
    /// The local registration including metadata not yet published.
    local: Arc<RwLock<ServiceInstance>>,
}

impl InMemoryRegistry {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Pushes the local registration to the shared state, as the periodic
    /// heartbeat of a real registry client would.
    pub fn heartbeat(&self) {
        let instance = self.local.read().clone();
        self.shared
            .services
            .write()
            .entry(self.service_id.clone())
            .or_default()
            .insert(self.instance_id.clone(), instance);
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn list_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>, GridError> {
        let services = self.shared.services.read();
        Ok(services
            .get(service_id)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), GridError> {
        self.local
            .write()
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn publish_now(&self) -> Result<(), GridError> {
        self.heartbeat();
        Ok(())
    }

    fn local_instance(&self) -> Option<ServiceInstance> {
        Some(self.local.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_handle_is_a_silent_no_op() {
        let handle = RegistryHandle::unregistered();
        assert!(!handle.is_registered());
        assert!(handle.list_instances().await.unwrap().is_empty());
        assert!(handle.local_instance().is_none());
        handle
            .register_bind_address(NodeRole::Member, "127.0.0.1", 5701)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn metadata_is_visible_after_publish() {
        let shared = SharedRegistry::default();
        let registry = Arc::new(shared.register("grid", "10.0.0.1", 8080));
        let handle = RegistryHandle::new("grid", registry.clone());

        handle
            .register_bind_address(NodeRole::Member, "10.0.0.1", 5701)
            .await
            .unwrap();

        let instances = handle.list_instances().await.unwrap();
        assert_eq!(instances.len(), 1);
        let instance = &instances[0];
        assert_eq!(instance.role(), NodeRole::Member);
        assert_eq!(instance.metadata(METADATA_BIND_HOST), Some("10.0.0.1"));
        assert_eq!(instance.metadata(METADATA_BIND_PORT), Some("5701"));
    }

    #[tokio::test]
    async fn unpublished_metadata_stays_local() {
        let shared = SharedRegistry::default();
        let registry = Arc::new(shared.register("grid", "10.0.0.1", 8080));

        registry.set_metadata("k", "v").await.unwrap();
        let listed = registry.list_instances("grid").await.unwrap();
        assert_eq!(listed[0].metadata("k"), None);

        registry.heartbeat();
        let listed = registry.list_instances("grid").await.unwrap();
        assert_eq!(listed[0].metadata("k"), Some("v"));
    }

    #[tokio::test]
    async fn missing_role_metadata_means_legacy_member() {
        let instance = ServiceInstance::new("a", "10.0.0.1", 8080);
        assert_eq!(instance.role(), NodeRole::Member);
    }
}
