//! Domain primitive types used across the warden workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{CONTAINER_NAME_MAX, ROOT_CONTAINER, WARDEN_ROOT_CONTAINER};
use crate::error::{Result, WardenError};

/// Numeric container identifier, stable for the container's lifetime.
///
/// Ids 1 and 2 are reserved for the two root containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

impl ContainerId {
    /// Id of the absolute root container `/`.
    pub const ROOT: Self = Self(1);
    /// Id of the warden root container `/warden`.
    pub const WARDEN_ROOT: Self = Self(2);

    /// Returns true for either reserved root id.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self == Self::ROOT || self == Self::WARDEN_ROOT
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Created but not started, or fully stopped.
    Stopped,
    /// The primary task is running.
    Running,
    /// Frozen via the freezer cgroup, directly or through an ancestor.
    Paused,
    /// Started with an empty command; a namespace/resource shell only.
    Meta,
    /// The task terminated and the container has not been removed yet.
    Dead,
}

impl ContainerState {
    /// Parses the canonical lowercase state name.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` for an unknown name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "meta" => Ok(Self::Meta),
            "dead" => Ok(Self::Dead),
            other => Err(WardenError::InvalidValue(format!(
                "unknown container state {other}"
            ))),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Meta => write!(f, "meta"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Credentials of a client or container owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Cred {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Root credentials.
    #[must_use]
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    /// True when the credentials may bypass ownership checks.
    #[must_use]
    pub fn is_privileged(self) -> bool {
        self.uid == 0
    }
}

impl fmt::Display for Cred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Validates one path component of a container name.
fn valid_name_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'))
}

/// Validates a full container name as supplied by a client.
///
/// A name is a `/`-joined list of components; the reserved root names are
/// accepted as-is. The empty string is never valid.
///
/// # Errors
///
/// Returns `invalid-value` describing the offending component.
pub fn validate_name(name: &str) -> Result<()> {
    if name == ROOT_CONTAINER || name == WARDEN_ROOT_CONTAINER {
        return Ok(());
    }
    if name.is_empty() || name.len() > CONTAINER_NAME_MAX {
        return Err(WardenError::InvalidValue(format!(
            "invalid container name {name:?}"
        )));
    }
    for component in name.split('/') {
        if !valid_name_component(component) {
            return Err(WardenError::InvalidValue(format!(
                "invalid name component {component:?} in {name:?}"
            )));
        }
    }
    Ok(())
}

/// Returns the parent portion of a container name, if any.
///
/// `a/b/c` → `Some("a/b")`; a single component has no parent name.
#[must_use]
pub fn parent_name(name: &str) -> Option<&str> {
    name.rfind('/').map(|idx| &name[..idx])
}

/// Returns the final component of a container name.
#[must_use]
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip_through_display() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Meta,
            ContainerState::Dead,
        ] {
            assert_eq!(ContainerState::parse(&state.to_string()).unwrap(), state);
        }
    }

    #[test]
    fn unknown_state_is_invalid_value() {
        let err = ContainerState::parse("zombie").unwrap_err();
        assert_eq!(err.kind(), "invalid-value");
    }

    #[test]
    fn root_names_are_valid() {
        validate_name(ROOT_CONTAINER).unwrap();
        validate_name(WARDEN_ROOT_CONTAINER).unwrap();
    }

    #[test]
    fn nested_names_are_valid() {
        validate_name("a").unwrap();
        validate_name("a/b").unwrap();
        validate_name("web-1/worker_2/shard.3").unwrap();
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a//b").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("/a").is_err());
    }

    #[test]
    fn parent_and_base_names() {
        assert_eq!(parent_name("a/b/c"), Some("a/b"));
        assert_eq!(parent_name("a"), None);
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("a"), "a");
    }

    #[test]
    fn reserved_ids() {
        assert!(ContainerId::ROOT.is_reserved());
        assert!(ContainerId::WARDEN_ROOT.is_reserved());
        assert!(!ContainerId(3).is_reserved());
    }

    #[test]
    fn privileged_cred_is_uid_zero() {
        assert!(Cred::root().is_privileged());
        assert!(!Cred::new(1000, 1000).is_privileged());
    }
}
