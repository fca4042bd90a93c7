//! Memory resource control and OOM event arming.
//!
//! Manages `memory.limit_in_bytes`, `memory.soft_limit_in_bytes`, and the
//! optional knobs probed at daemon start (`memory.low_limit_in_bytes`,
//! `memory.recharge_on_pgfault`, `memory.fs_bps_limit`).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use warden_common::error::{Result, WardenError};

use super::{Cgroup, Subsystem};

const LIMIT: &str = "memory.limit_in_bytes";
const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const LOW_LIMIT: &str = "memory.low_limit_in_bytes";
const USE_HIERARCHY: &str = "memory.use_hierarchy";
const RECHARGE_ON_PGFAULT: &str = "memory.recharge_on_pgfault";
const FS_BPS_LIMIT: &str = "memory.fs_bps_limit";
const USAGE: &str = "memory.usage_in_bytes";
const OOM_CONTROL: &str = "memory.oom_control";
const EVENT_CONTROL: &str = "cgroup.event_control";

/// Sets the hard memory limit; zero means unlimited.
///
/// The kernel refuses with EBUSY when current usage already exceeds the
/// requested limit; that case is reported as `invalid-value` so a client
/// sees "limit too low" rather than a raw errno.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn set_limit(cg: &Cgroup<'_>, limit: u64) -> Result<()> {
    let value = if limit == 0 { u64::MAX } else { limit };
    match cg.set_knob_u64(LIMIT, value) {
        Err(WardenError::Io { source, .. })
            if source.raw_os_error() == Some(libc::EBUSY) =>
        {
            Err(WardenError::InvalidValue("memory limit is too low".into()))
        }
        other => other,
    }
}

/// Sets the soft limit used by the meta-container reclaim walk.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn set_soft_limit(cg: &Cgroup<'_>, limit: u64) -> Result<()> {
    cg.set_knob_u64(SOFT_LIMIT, limit)
}

/// Reads the current soft limit.
///
/// # Errors
///
/// Returns an error if reading the knob fails.
pub fn soft_limit(cg: &Cgroup<'_>) -> Result<u64> {
    cg.get_knob_u64(SOFT_LIMIT)
}

/// True when the kernel supports memory guarantees.
#[must_use]
pub fn supports_guarantee(subsystem: &Subsystem) -> bool {
    subsystem.has_knob(LOW_LIMIT)
}

/// Sets the memory guarantee, a no-op on kernels without the knob.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn set_guarantee(cg: &Cgroup<'_>, guarantee: u64) -> Result<()> {
    if !supports_guarantee(cg.subsystem()) {
        return Ok(());
    }
    cg.set_knob_u64(LOW_LIMIT, guarantee)
}

/// Enables or disables hierarchical accounting.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn use_hierarchy(cg: &Cgroup<'_>, enable: bool) -> Result<()> {
    cg.set_knob(USE_HIERARCHY, if enable { "1" } else { "0" })
}

/// Sets page-fault recharging, a no-op on kernels without the knob.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn recharge_on_pgfault(cg: &Cgroup<'_>, enable: bool) -> Result<()> {
    if !cg.subsystem().has_knob(RECHARGE_ON_PGFAULT) {
        return Ok(());
    }
    cg.set_knob(RECHARGE_ON_PGFAULT, if enable { "1" } else { "0" })
}

/// Sets the filesystem bandwidth limit, a no-op on kernels without the knob.
///
/// # Errors
///
/// Returns an error if writing the knob fails.
pub fn set_io_limit(cg: &Cgroup<'_>, limit: u64) -> Result<()> {
    if !cg.subsystem().has_knob(FS_BPS_LIMIT) {
        return Ok(());
    }
    cg.set_knob_u64(FS_BPS_LIMIT, limit)
}

/// Current memory usage in bytes.
///
/// # Errors
///
/// Returns an error if reading the knob fails.
pub fn usage(cg: &Cgroup<'_>) -> Result<u64> {
    cg.get_knob_u64(USAGE)
}

/// Arms OOM notification for a memory cgroup.
///
/// Opens `memory.oom_control` read-only, creates a non-blocking
/// close-on-exec eventfd, and registers the pair through
/// `cgroup.event_control`. The returned eventfd becomes readable when the
/// kernel OOM-kills inside the cgroup; the caller adds it to the event
/// loop and owns its lifetime.
///
/// # Errors
///
/// Returns an error if any of the three steps fails.
pub fn arm_oom_notification(cg: &Cgroup<'_>) -> Result<OwnedFd> {
    // SAFETY: eventfd(2) returns a fresh descriptor we immediately take
    // ownership of, or -1.
    let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if raw < 0 {
        return Err(WardenError::errno(
            "eventfd",
            nix::errno::Errno::last(),
        ));
    }
    // SAFETY: raw is a valid fd owned by no one else.
    let efd = unsafe { OwnedFd::from_raw_fd(raw) };

    let control_path = cg.path().join(OOM_CONTROL);
    let control = std::fs::File::open(&control_path)
        .map_err(|e| WardenError::io(control_path, e))?;

    let registration = format!("{} {}", efd.as_raw_fd(), control.as_raw_fd());
    cg.set_knob(EVENT_CONTROL, &registration)?;

    tracing::debug!(cgroup = %cg, efd = efd.as_raw_fd(), "armed OOM notification");
    Ok(efd)
}

/// Non-destructively checks whether an armed OOM eventfd has fired.
#[must_use]
pub fn oom_fd_triggered(fd: &OwnedFd) -> bool {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd points at a single valid pollfd for the whole call.
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    ret == 1 && (pfd.revents & libc::POLLIN) != 0
}

/// Drains a fired eventfd so it can rearm.
pub fn drain_oom_fd(fd: &OwnedFd) {
    let mut buf = [0_u8; 8];
    // SAFETY: buf is 8 writable bytes, the size an eventfd read requires.
    let _ = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::SubsystemKind;

    fn memory_cgroup(dir: &std::path::Path) -> (Subsystem, String) {
        std::fs::create_dir_all(dir.join("memory")).unwrap();
        let subsystem = Subsystem::probe(SubsystemKind::Memory, dir);
        (subsystem, "warden/t".to_string())
    }

    #[test]
    fn zero_limit_writes_unlimited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (subsystem, rel) = memory_cgroup(dir.path());
        let cg = subsystem.cgroup(&rel);
        cg.create().unwrap();
        set_limit(&cg, 0).unwrap();
        assert_eq!(cg.get_knob(LIMIT).unwrap(), "-1");
        set_limit(&cg, 4096).unwrap();
        assert_eq!(cg.get_knob_u64(LIMIT).unwrap(), 4096);
    }

    #[test]
    fn guarantee_is_noop_without_knob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (subsystem, rel) = memory_cgroup(dir.path());
        let cg = subsystem.cgroup(&rel);
        cg.create().unwrap();
        assert!(!supports_guarantee(&subsystem));
        set_guarantee(&cg, 1 << 20).unwrap();
        assert!(!cg.has_knob(LOW_LIMIT));
    }

    #[test]
    fn guarantee_written_when_probed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (subsystem, rel) = memory_cgroup(dir.path());
        std::fs::write(dir.path().join("memory").join(LOW_LIMIT), "0").unwrap();
        let cg = subsystem.cgroup(&rel);
        cg.create().unwrap();
        set_guarantee(&cg, 1 << 20).unwrap();
        assert_eq!(cg.get_knob_u64(LOW_LIMIT).unwrap(), 1 << 20);
    }

    #[test]
    fn soft_limit_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (subsystem, rel) = memory_cgroup(dir.path());
        let cg = subsystem.cgroup(&rel);
        cg.create().unwrap();
        set_soft_limit(&cg, 1 << 20).unwrap();
        assert_eq!(soft_limit(&cg).unwrap(), 1 << 20);
    }
}
