//! Unified error types for the warden workspace.
//!
//! Every fallible operation in the daemon returns [`WardenError`]. The
//! variants mirror the kinds a client can observe in an RPC response, so
//! converting an error into a wire reply never loses information.

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A client supplied a malformed or out-of-range value.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The operation is not allowed in the container's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The property name is unknown.
    #[error("invalid property: {0}")]
    InvalidProperty(String),

    /// The data name is unknown.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The name is known but not implemented on this kernel.
    #[error("{0} is not supported")]
    NotSupported(String),

    /// The caller is not privileged for the operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// No container with the requested name exists.
    #[error("container does not exist: {0}")]
    ContainerDoesNotExist(String),

    /// A container with the requested name already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// An underlying syscall or I/O operation failed.
    #[error("{context}: {source}")]
    Unknown {
        /// What the daemon was doing when the error occurred.
        context: String,
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// A file operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl WardenError {
    /// Builds an [`WardenError::Unknown`] from an errno and a context string.
    pub fn errno(context: impl Into<String>, source: nix::errno::Errno) -> Self {
        Self::Unknown {
            context: context.into(),
            source,
        }
    }

    /// Builds an [`WardenError::Io`] from a path and an I/O error.
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable kind string used in RPC responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidValue(_) => "invalid-value",
            Self::InvalidState(_) => "invalid-state",
            Self::InvalidProperty(_) => "invalid-property",
            Self::InvalidData(_) => "invalid-data",
            Self::NotSupported(_) => "not-supported",
            Self::Permission(_) => "permission",
            Self::ContainerDoesNotExist(_) => "container-does-not-exist",
            Self::ContainerAlreadyExists(_) => "container-already-exists",
            Self::Unknown { .. } | Self::Io { .. } | Self::Serialization { .. } => "unknown",
        }
    }

    /// Underlying errno, when the error wraps one.
    #[must_use]
    pub fn raw_errno(&self) -> Option<i32> {
        match self {
            Self::Unknown { source, .. } => Some(*source as i32),
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_rpc_taxonomy() {
        assert_eq!(WardenError::InvalidValue("x".into()).kind(), "invalid-value");
        assert_eq!(WardenError::InvalidState("x".into()).kind(), "invalid-state");
        assert_eq!(
            WardenError::ContainerDoesNotExist("a/b".into()).kind(),
            "container-does-not-exist"
        );
        assert_eq!(
            WardenError::errno("open", nix::errno::Errno::ENOENT).kind(),
            "unknown"
        );
    }

    #[test]
    fn unknown_carries_errno() {
        let err = WardenError::errno("write cgroup.procs", nix::errno::Errno::EBUSY);
        assert_eq!(err.raw_errno(), Some(nix::errno::Errno::EBUSY as i32));
        let msg = format!("{err}");
        assert!(msg.contains("write cgroup.procs"));
    }

    #[test]
    fn io_error_preserves_path() {
        let err = WardenError::io(
            "/sys/fs/cgroup/memory",
            std::io::Error::from_raw_os_error(13),
        );
        assert!(format!("{err}").contains("/sys/fs/cgroup/memory"));
        assert_eq!(err.raw_errno(), Some(13));
    }

    #[test]
    fn permission_has_no_errno() {
        assert_eq!(WardenError::Permission("not owner".into()).raw_errno(), None);
    }
}
