use std::path::PathBuf;

use crate::error::GridError;

/// Encodes non-trivial value types into bytes so they can cross the wire
/// and live in distributed maps.
pub trait BinaryCodec<T>: Send + Sync {
    /// Stable name the codec is registered under.
    fn type_name(&self) -> &'static str;

    fn encode(&self, value: &T) -> Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> Result<T, GridError>;
}

#[derive(Debug, Default, Clone, Copy)]
/// Codec for opaque filesystem-path values.
///
/// Paths are carried as their UTF-8 string representation, which is portable
/// across nodes even when their filesystems differ.
pub struct PathCodec;

impl BinaryCodec<PathBuf> for PathCodec {
    fn type_name(&self) -> &'static str {
        "path"
    }

    fn encode(&self, value: &PathBuf) -> Vec<u8> {
        value.to_string_lossy().into_owned().into_bytes()
    }

    fn decode(&self, bytes: &[u8]) -> Result<PathBuf, GridError> {
        let raw = std::str::from_utf8(bytes)
            .map_err(|e| GridError::Codec(format!("path payload is not UTF-8: {e}")))?;
        Ok(PathBuf::from(raw))
    }
}
