use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::GridError;
use crate::registry::{ServiceInstance, METADATA_BIND_HOST, METADATA_BIND_PORT};

/// Strips the literal brackets some registries add around IPv6 hosts.
///
/// `"[::1]"` becomes `"::1"`. Anything without surrounding brackets is
/// returned unchanged, including the empty string.
pub fn normalize_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Formats a host/port pair in the grid transport's addressing scheme.
///
/// Hosts containing a colon are treated as IPv6 literals and re-bracketed,
/// producing `"[::1]:5701"` vs `"10.0.0.1:5701"`.
pub fn format_for_cluster(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A `(host, port)` pair in the grid transport's own addressing scheme.
///
/// The host is always stored in normalized (bracket-free) form; brackets are
/// re-added on display if and only if the host looks like an IPv6 literal.
pub struct ClusterAddr {
    host: String,
    port: u16,
}

impl ClusterAddr {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: normalize_host(host.as_ref()).to_string(),
            port,
        }
    }

    /// Parses a formatted cluster address, accepting both the bracketed IPv6
    /// form (`"[::1]:5701"`) and the plain form (`"10.0.0.1:5701"`,
    /// `"node-1:5701"`).
    pub fn parse(raw: &str) -> Result<Self, GridError> {
        let malformed = || GridError::MalformedAddress(raw.to_string());

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(malformed)?;
            (host, port)
        } else {
            let (host, port) = raw.rsplit_once(':').ok_or_else(malformed)?;
            // A bare colon-bearing host without brackets is ambiguous.
            if host.contains(':') {
                return Err(malformed());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for ClusterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_for_cluster(&self.host, self.port))
    }
}

impl FromStr for ClusterAddr {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Resolves the cluster address advertised by a registry instance.
///
/// An explicit cluster-bind-host metadata key takes precedence over the
/// registry's own host field (the two may legitimately differ behind NAT or
/// on multi-homed hosts), and an explicit cluster-bind-port key takes
/// precedence over the configured default port. Missing metadata falls back;
/// metadata that is present but unparseable is an error so that callers can
/// drop the single bad instance rather than dial a bogus address.
pub fn resolve_cluster_address(
    instance: &ServiceInstance,
    default_port: u16,
) -> Result<ClusterAddr, GridError> {
    let host = instance
        .metadata(METADATA_BIND_HOST)
        .filter(|h| !h.is_empty())
        .unwrap_or(&instance.host);

    let port = match instance.metadata(METADATA_BIND_PORT) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            GridError::MalformedAddress(format!(
                "{} advertises bind port {raw:?}",
                instance.instance_id
            ))
        })?,
        None => default_port,
    };

    Ok(ClusterAddr::new(host, port))
}

/// Whether a registry instance resolves to the local node's own address.
///
/// Used to avoid a node adding itself as a peer or warning about itself as
/// stale. Unresolvable instances are never "self".
pub fn is_self(instance: &ServiceInstance, own: &ClusterAddr, default_port: u16) -> bool {
    resolve_cluster_address(instance, default_port)
        .map(|addr| addr == *own)
        .unwrap_or(false)
}
