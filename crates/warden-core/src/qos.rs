//! Traffic-class handles for network QoS.
//!
//! Every network-enabled container owns one class below its parent's
//! class; the minor number is the container id, so handles stay stable
//! across restarts and the tree mirrors the container tree. Programming
//! the qdisc itself is left to the netlink layer; this module owns the
//! handle arithmetic and the per-interface rate bookkeeping that the
//! netcls classid knob consumes.

use std::collections::HashMap;

use warden_common::error::{Result, WardenError};

/// A `major:minor` traffic-class handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcHandle(pub u32);

impl TcHandle {
    /// Composes a handle from its major and minor halves.
    #[must_use]
    pub fn new(major: u16, minor: u16) -> Self {
        Self((u32::from(major) << 16) | u32::from(minor))
    }

    /// Major half, identifying the qdisc.
    #[must_use]
    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Minor half, identifying the class.
    #[must_use]
    pub fn minor(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Derives a child handle: the parent's major with the container id
    /// as minor.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` when the id does not fit the minor field.
    pub fn for_child(self, container_id: u32) -> Result<Self> {
        let minor = u16::try_from(container_id).map_err(|_| {
            WardenError::InvalidValue(format!(
                "container id {container_id} does not fit a tc minor"
            ))
        })?;
        Ok(Self::new(self.major(), minor))
    }
}

impl std::fmt::Display for TcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{:x}", self.major(), self.minor())
    }
}

/// One container's traffic class with its per-interface settings.
#[derive(Debug, Clone)]
pub struct TrafficClass {
    handle: TcHandle,
    parent: TcHandle,
    /// Interface → priority.
    pub prio: HashMap<String, u64>,
    /// Interface → guaranteed rate, bytes per second.
    pub rate: HashMap<String, u64>,
    /// Interface → ceiling rate, bytes per second.
    pub ceil: HashMap<String, u64>,
}

impl TrafficClass {
    /// Creates the class for a container below its parent's class.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` when the container id overflows the handle.
    pub fn for_container(parent: TcHandle, container_id: u32) -> Result<Self> {
        Ok(Self {
            handle: parent.for_child(container_id)?,
            parent,
            prio: HashMap::new(),
            rate: HashMap::new(),
            ceil: HashMap::new(),
        })
    }

    /// The class handle, also used as the netcls classid.
    #[must_use]
    pub fn handle(&self) -> TcHandle {
        self.handle
    }

    /// Handle of the parent class.
    #[must_use]
    pub fn parent(&self) -> TcHandle {
        self.parent
    }

    /// Installs the per-interface maps, validating that ceil is never
    /// below rate on any interface both maps name.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` naming the offending interface.
    pub fn configure(
        &mut self,
        prio: HashMap<String, u64>,
        rate: HashMap<String, u64>,
        ceil: HashMap<String, u64>,
    ) -> Result<()> {
        for (iface, &ceiling) in &ceil {
            if let Some(&guaranteed) = rate.get(iface) {
                if ceiling != 0 && ceiling < guaranteed {
                    return Err(WardenError::InvalidValue(format!(
                        "net limit below guarantee on {iface}"
                    )));
                }
            }
        }
        self.prio = prio;
        self.rate = rate;
        self.ceil = ceil;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_halves_compose() {
        let h = TcHandle::new(1, 0x2a);
        assert_eq!(h.major(), 1);
        assert_eq!(h.minor(), 0x2a);
        assert_eq!(h.to_string(), "1:2a");
    }

    #[test]
    fn child_handle_keeps_major_and_uses_id() {
        let root = TcHandle::new(1, 0);
        let child = root.for_child(5).unwrap();
        assert_eq!(child.major(), 1);
        assert_eq!(child.minor(), 5);
    }

    #[test]
    fn oversized_id_is_rejected() {
        let root = TcHandle::new(1, 0);
        assert!(root.for_child(0x1_0000).is_err());
    }

    #[test]
    fn grandchild_stays_under_same_major() {
        let root = TcHandle::new(3, 0);
        let child = root.for_child(4).unwrap();
        let grandchild = child.for_child(9).unwrap();
        assert_eq!(grandchild.major(), 3);
        assert_eq!(grandchild.minor(), 9);
    }

    #[test]
    fn configure_rejects_ceil_below_rate() {
        let mut class = TrafficClass::for_container(TcHandle::new(1, 0), 3).unwrap();
        let rate = HashMap::from([("eth0".to_string(), 1000)]);
        let ceil = HashMap::from([("eth0".to_string(), 500)]);
        let err = class
            .configure(HashMap::new(), rate.clone(), ceil)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-value");

        let ceil_ok = HashMap::from([("eth0".to_string(), 2000)]);
        class.configure(HashMap::new(), rate, ceil_ok).unwrap();
        assert_eq!(class.rate["eth0"], 1000);
    }
}
