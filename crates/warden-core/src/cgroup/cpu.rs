//! CPU bandwidth, shares, and scheduling-policy control.

use warden_common::error::{Result, WardenError};

use super::Cgroup;

const SHARES: &str = "cpu.shares";
const CFS_PERIOD: &str = "cpu.cfs_period_us";
const CFS_QUOTA: &str = "cpu.cfs_quota_us";
const RT_RUNTIME: &str = "cpu.rt_runtime_us";

/// Default CFS period used when setting a quota.
const PERIOD_US: u64 = 100_000;

/// Baseline shares value for a container with no guarantee.
const BASE_SHARES: u64 = 1024;

/// Minimum shares the kernel accepts.
const MIN_SHARES: u64 = 2;

/// Scheduling policy names accepted by the `cpu_policy` property.
pub const POLICIES: &[&str] = &["normal", "rt", "batch"];

/// Applies a scheduling policy to the cgroup.
///
/// `normal` restores baseline shares, `batch` drops to the minimum so the
/// group only runs on otherwise-idle cycles, and `rt` grants the realtime
/// runtime budget when the kernel exposes it.
///
/// # Errors
///
/// Returns `invalid-value` for an unknown policy name or an error from the
/// knob writes.
pub fn set_policy(cg: &Cgroup<'_>, policy: &str) -> Result<()> {
    match policy {
        "normal" => cg.set_knob_u64(SHARES, BASE_SHARES),
        "batch" => cg.set_knob_u64(SHARES, MIN_SHARES),
        "rt" => {
            if cg.subsystem().has_knob(RT_RUNTIME) {
                cg.set_knob(RT_RUNTIME, "-1")?;
            }
            cg.set_knob_u64(SHARES, BASE_SHARES * 16)
        }
        other => Err(WardenError::InvalidValue(format!(
            "unknown cpu policy {other:?}"
        ))),
    }
}

/// Sets the CFS bandwidth limit as a percentage of one core; zero or 100
/// and above on a single-core budget means unlimited.
///
/// # Errors
///
/// Returns an error if the knob writes fail.
pub fn set_limit(cg: &Cgroup<'_>, percent: u64) -> Result<()> {
    cg.set_knob_u64(CFS_PERIOD, PERIOD_US)?;
    if percent == 0 {
        return cg.set_knob(CFS_QUOTA, "-1");
    }
    let quota = PERIOD_US * percent / 100;
    cg.set_knob_u64(CFS_QUOTA, quota.max(1_000))
}

/// Sets the CPU guarantee as a percentage, expressed through shares.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_guarantee(cg: &Cgroup<'_>, percent: u64) -> Result<()> {
    let shares = if percent == 0 {
        BASE_SHARES
    } else {
        (BASE_SHARES * percent / 100).max(MIN_SHARES)
    };
    cg.set_knob_u64(SHARES, shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{Subsystem, SubsystemKind};

    fn cpu_cgroup(dir: &std::path::Path) -> Subsystem {
        std::fs::create_dir_all(dir.join("cpu")).unwrap();
        Subsystem::probe(SubsystemKind::Cpu, dir)
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = cpu_cgroup(dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        assert!(set_policy(&cg, "deadline").is_err());
    }

    #[test]
    fn batch_policy_floors_shares() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = cpu_cgroup(dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        set_policy(&cg, "batch").unwrap();
        assert_eq!(cg.get_knob_u64(SHARES).unwrap(), MIN_SHARES);
    }

    #[test]
    fn zero_limit_clears_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = cpu_cgroup(dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        set_limit(&cg, 0).unwrap();
        assert_eq!(cg.get_knob(CFS_QUOTA).unwrap(), "-1");
    }

    #[test]
    fn fifty_percent_limit_halves_period() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = cpu_cgroup(dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        set_limit(&cg, 50).unwrap();
        assert_eq!(cg.get_knob_u64(CFS_QUOTA).unwrap(), PERIOD_US / 2);
        assert_eq!(cg.get_knob_u64(CFS_PERIOD).unwrap(), PERIOD_US);
    }

    #[test]
    fn guarantee_scales_shares() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = cpu_cgroup(dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        set_guarantee(&cg, 200).unwrap();
        assert_eq!(cg.get_knob_u64(SHARES).unwrap(), BASE_SHARES * 2);
    }
}
