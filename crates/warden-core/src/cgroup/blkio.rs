//! Block I/O weight control.

use warden_common::error::Result;

use super::Cgroup;

const WEIGHT: &str = "blkio.weight";

/// Weight for the default I/O policy.
const NORMAL_WEIGHT: u64 = 500;

/// Weight for the batch policy, deprioritized behind everything else.
const BATCH_WEIGHT: u64 = 10;

/// Applies the I/O policy; `batch` yields to all non-batch siblings.
///
/// Kernels without CFQ weights accept no knob; the call is then a no-op.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_policy(cg: &Cgroup<'_>, batch: bool) -> Result<()> {
    if !cg.subsystem().has_knob(WEIGHT) {
        return Ok(());
    }
    let weight = if batch { BATCH_WEIGHT } else { NORMAL_WEIGHT };
    cg.set_knob_u64(WEIGHT, weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{Subsystem, SubsystemKind};

    #[test]
    fn policy_maps_to_weight() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("blkio")).unwrap();
        std::fs::write(dir.path().join("blkio").join(WEIGHT), "500").unwrap();
        let subsystem = Subsystem::probe(SubsystemKind::Blkio, dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();

        set_policy(&cg, true).unwrap();
        assert_eq!(cg.get_knob_u64(WEIGHT).unwrap(), BATCH_WEIGHT);
        set_policy(&cg, false).unwrap();
        assert_eq!(cg.get_knob_u64(WEIGHT).unwrap(), NORMAL_WEIGHT);
    }

    #[test]
    fn missing_weight_knob_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("blkio")).unwrap();
        let subsystem = Subsystem::probe(SubsystemKind::Blkio, dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        set_policy(&cg, true).unwrap();
    }
}
