use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("missing required configuration value: {0}")]
    /// A required configuration value was absent during bootstrap.
    ///
    /// This aborts startup. A half-configured grid node is worse than a
    /// crashed one.
    MissingConfig(&'static str),

    #[error("invalid configuration value for `{key}`: {value:?}")]
    /// A configuration value was present but could not be parsed.
    InvalidConfig { key: &'static str, value: String },

    #[error("clustering is disabled for this deployment topology")]
    /// The deployment topology does not run the coordination layer at all.
    ClusteringDisabled,

    #[error("service registry error: {0}")]
    /// The external service registry could not be reached or rejected a call.
    Registry(String),

    #[error("malformed cluster address: {0}")]
    /// An address string could not be parsed into a cluster address.
    MalformedAddress(String),

    #[error("no shared queue is configured for this node role")]
    /// The shared job queue was requested on a node whose role does not
    /// carry one.
    QueueNotConfigured,

    #[error("shared queue `{0}` is already open with a different job type")]
    /// The shared queue was requested with a job type other than the one it
    /// was first opened with.
    QueueTypeConflict(String),

    #[error("codec error: {0}")]
    /// A registered value codec failed to decode a payload.
    Codec(String),

    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),
}
