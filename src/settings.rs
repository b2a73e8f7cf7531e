use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GridError;

/// Default transport port, doubling as the offset added to the HTTP port in
/// colocated-dev mode.
pub const DEFAULT_CLUSTER_PORT: u16 = 5701;
const DEFAULT_BACKUP_COUNT: u16 = 1;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
/// Static configuration of the local grid node.
///
/// Read once at startup; a missing or unparseable required value aborts
/// startup rather than producing a partially configured cluster node.
pub struct GridSettings {
    /// Fixed logical instance name of this process.
    pub instance_name: String,
    /// Explicit network interface the grid transport binds to. When unset
    /// the node binds to loopback only, as a conservative default.
    pub interface: Option<String>,
    /// The cluster transport port. In colocated-dev mode this acts as an
    /// offset added to `http_port` instead, so multiple nodes on one machine
    /// don't collide.
    pub port: u16,
    /// Colocated-dev mode: every node shares one host and derives a unique
    /// port from its HTTP port.
    pub local_instances: bool,
    /// The HTTP port of the surrounding application, used for port
    /// derivation in colocated-dev mode.
    pub http_port: u16,
    /// Synchronous backup count for maps and the shared queue.
    pub backup_count: u16,
    /// Bounded lifetime for cache entries in TTL-carrying maps.
    pub cache_ttl: Duration,
    /// Human-readable display name gossiped with the member, for logs and
    /// debugging. Falls back to the registry instance id.
    pub display_name: Option<String>,
}

impl GridSettings {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            interface: None,
            port: DEFAULT_CLUSTER_PORT,
            local_instances: true,
            http_port: 8080,
            backup_count: DEFAULT_BACKUP_COUNT,
            cache_ttl: DEFAULT_CACHE_TTL,
            display_name: None,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local_instances(mut self, local: bool) -> Self {
        self.local_instances = local;
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_backup_count(mut self, count: u16) -> Self {
        self.backup_count = count;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Loads settings from `GRIDLINK_*` environment variables.
    ///
    /// `GRIDLINK_INSTANCE_NAME` is required; everything else falls back to
    /// the defaults of [`GridSettings::new`].
    pub fn from_env() -> Result<Self, GridError> {
        let instance_name = env::var("GRIDLINK_INSTANCE_NAME")
            .map_err(|_| GridError::MissingConfig("GRIDLINK_INSTANCE_NAME"))?;

        let mut settings = Self::new(instance_name);
        settings.interface = env::var("GRIDLINK_INTERFACE").ok().filter(|v| !v.is_empty());
        settings.display_name = env::var("GRIDLINK_DISPLAY_NAME").ok().filter(|v| !v.is_empty());

        if let Some(port) = parse_env("GRIDLINK_PORT")? {
            settings.port = port;
        }
        if let Some(local) = parse_env("GRIDLINK_LOCAL_INSTANCES")? {
            settings.local_instances = local;
        }
        if let Some(http_port) = parse_env("GRIDLINK_HTTP_PORT")? {
            settings.http_port = http_port;
        }
        if let Some(backups) = parse_env("GRIDLINK_BACKUP_COUNT")? {
            settings.backup_count = backups;
        }
        if let Some(secs) = parse_env::<u64>("GRIDLINK_CACHE_TTL_SECS")? {
            settings.cache_ttl = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>, GridError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| GridError::InvalidConfig { key, value: raw }),
        Err(_) => Ok(None),
    }
}
