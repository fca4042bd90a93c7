//! Cgroups v1 resource management.
//!
//! Each kernel controller is represented by a [`Subsystem`] probed once at
//! daemon start; a [`Cgroup`] is the pair (subsystem, relative path). The
//! leaf cgroup of container `a/b` under subsystem `memory` lives at
//! `/sys/fs/cgroup/memory/warden/a/b`.

pub mod blkio;
pub mod cpu;
pub mod devices;
pub mod freezer;
pub mod memory;
pub mod netcls;

use std::path::{Path, PathBuf};

use warden_common::error::{Result, WardenError};

/// One kernel cgroup controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemKind {
    /// CPU bandwidth and scheduling policy.
    Cpu,
    /// CPU accounting.
    Cpuacct,
    /// Memory limits and OOM control.
    Memory,
    /// Freezer, used for pause/resume and the kill protocol.
    Freezer,
    /// Block I/O weights.
    Blkio,
    /// Device access allowlist.
    Devices,
    /// Network classifier ids for traffic shaping.
    Netcls,
}

impl SubsystemKind {
    /// Controller directory name under the cgroup mount root.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Memory => "memory",
            Self::Freezer => "freezer",
            Self::Blkio => "blkio",
            Self::Devices => "devices",
            Self::Netcls => "net_cls",
        }
    }

    /// All controllers the daemon knows about, in preparation order.
    #[must_use]
    pub fn all() -> &'static [SubsystemKind] {
        &[
            Self::Cpu,
            Self::Cpuacct,
            Self::Memory,
            Self::Freezer,
            Self::Blkio,
            Self::Devices,
            Self::Netcls,
        ]
    }
}

impl std::fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A probed controller with its mount point.
///
/// Subsystems are created once at daemon start and treated as immutable
/// afterwards; every [`Cgroup`] borrows one.
#[derive(Debug)]
pub struct Subsystem {
    kind: SubsystemKind,
    mount: PathBuf,
    supported: bool,
}

impl Subsystem {
    /// Probes a controller under the given cgroup mount root.
    #[must_use]
    pub fn probe(kind: SubsystemKind, cgroup_root: &Path) -> Self {
        let mount = cgroup_root.join(kind.name());
        let supported = mount.is_dir();
        if !supported {
            tracing::warn!(subsystem = %kind, "controller not mounted");
        }
        Self {
            kind,
            mount,
            supported,
        }
    }

    /// Controller identity.
    #[must_use]
    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Whether the controller is mounted on this host.
    #[must_use]
    pub fn supported(&self) -> bool {
        self.supported
    }

    /// Mount point of the controller hierarchy.
    #[must_use]
    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// The hierarchy root as a cgroup handle.
    #[must_use]
    pub fn root_cgroup(&self) -> Cgroup<'_> {
        Cgroup {
            subsystem: self,
            rel: String::new(),
        }
    }

    /// A cgroup at `rel` below the hierarchy root.
    #[must_use]
    pub fn cgroup(&self, rel: &str) -> Cgroup<'_> {
        Cgroup {
            subsystem: self,
            rel: rel.trim_matches('/').to_string(),
        }
    }

    /// True when the hierarchy root exposes the named knob.
    #[must_use]
    pub fn has_knob(&self, knob: &str) -> bool {
        self.mount.join(knob).exists()
    }
}

/// Parses a controller knob value, accepting the `"max"` sentinel.
///
/// # Errors
///
/// Returns `invalid-value` when the text is neither a number nor `max`.
pub fn parse_knob_u64(text: &str) -> Result<u64> {
    let text = text.trim();
    if text == "max" || text == "-1" {
        return Ok(u64::MAX);
    }
    text.parse::<u64>()
        .map_err(|_| WardenError::InvalidValue(format!("bad controller value {text:?}")))
}

/// Formats a value for a controller knob, mapping `u64::MAX` back to `-1`
/// (v1 controllers use -1 for "unlimited").
#[must_use]
pub fn format_knob_u64(value: u64) -> String {
    if value == u64::MAX {
        "-1".to_string()
    } else {
        value.to_string()
    }
}

/// Handle to one cgroup directory under one controller.
#[derive(Debug, Clone)]
pub struct Cgroup<'a> {
    subsystem: &'a Subsystem,
    rel: String,
}

impl<'a> Cgroup<'a> {
    /// Owning subsystem.
    #[must_use]
    pub fn subsystem(&self) -> &'a Subsystem {
        self.subsystem
    }

    /// Path relative to the controller mount.
    #[must_use]
    pub fn rel_path(&self) -> &str {
        &self.rel
    }

    /// Absolute path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.subsystem.mount.join(&self.rel)
    }

    /// A child cgroup one level below this one.
    #[must_use]
    pub fn child(&self, name: &str) -> Cgroup<'a> {
        let rel = if self.rel.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.rel)
        };
        Cgroup {
            subsystem: self.subsystem,
            rel,
        }
    }

    /// True for the hierarchy root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rel.is_empty()
    }

    /// Whether the directory currently exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    /// Creates the cgroup directory, idempotent if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `mkdir` fails for a reason other than EEXIST.
    pub fn create(&self) -> Result<()> {
        let path = self.path();
        match std::fs::create_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(cgroup = %self, "created");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    /// Removes the cgroup directory.
    ///
    /// A directory with surviving tasks fails with EBUSY; the caller is
    /// expected to resolve that through the kill protocol and retry.
    ///
    /// # Errors
    ///
    /// Returns an error if `rmdir` fails; ENOENT is treated as success.
    pub fn remove(&self) -> Result<()> {
        let path = self.path();
        match std::fs::remove_dir(&path) {
            Ok(()) => {
                tracing::debug!(cgroup = %self, "removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    /// Attaches a process by writing its pid to `cgroup.procs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn attach(&self, pid: nix::unistd::Pid) -> Result<()> {
        self.set_knob("cgroup.procs", &pid.as_raw().to_string())
    }

    /// Pids of all processes in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    pub fn procs(&self) -> Result<Vec<nix::unistd::Pid>> {
        self.read_pids("cgroup.procs")
    }

    /// Pids of all tasks (threads) in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `tasks` cannot be read.
    pub fn tasks(&self) -> Result<Vec<nix::unistd::Pid>> {
        self.read_pids("tasks")
    }

    /// True when the cgroup holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks().map_or(true, |pids| pids.is_empty())
    }

    /// Signals every task in the cgroup; ESRCH on individual pids is
    /// ignored (the task exited between enumeration and kill).
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read or a kill fails
    /// for a reason other than ESRCH.
    pub fn kill_all(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        for pid in self.tasks()? {
            match nix::sys::signal::kill(pid, signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(WardenError::errno(format!("kill({pid})"), e)),
            }
        }
        Ok(())
    }

    /// Reads a knob as raw text.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file cannot be read.
    pub fn get_knob(&self, knob: &str) -> Result<String> {
        let path = self.path().join(knob);
        std::fs::read_to_string(&path).map_err(|e| WardenError::io(path, e))
    }

    /// Writes a knob as raw text.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file cannot be written.
    pub fn set_knob(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.path().join(knob);
        std::fs::write(&path, value).map_err(|e| WardenError::io(path, e))
    }

    /// Reads a numeric knob, mapping the `"max"` sentinel to `u64::MAX`.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read or parsed.
    pub fn get_knob_u64(&self, knob: &str) -> Result<u64> {
        parse_knob_u64(&self.get_knob(knob)?)
    }

    /// Writes a numeric knob.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be written.
    pub fn set_knob_u64(&self, knob: &str, value: u64) -> Result<()> {
        self.set_knob(knob, &format_knob_u64(value))
    }

    /// Whether this cgroup directory exposes the named knob.
    #[must_use]
    pub fn has_knob(&self, knob: &str) -> bool {
        self.path().join(knob).exists()
    }

    fn read_pids(&self, knob: &str) -> Result<Vec<nix::unistd::Pid>> {
        let text = self.get_knob(knob)?;
        Ok(text
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(nix::unistd::Pid::from_raw)
            .collect())
    }
}

impl std::fmt::Display for Cgroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:/{}", self.subsystem.kind(), self.rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_subsystem(dir: &Path) -> Subsystem {
        std::fs::create_dir_all(dir.join("memory")).unwrap();
        Subsystem::probe(SubsystemKind::Memory, dir)
    }

    #[test]
    fn knob_parse_accepts_max_sentinel() {
        assert_eq!(parse_knob_u64("max").unwrap(), u64::MAX);
        assert_eq!(parse_knob_u64("-1\n").unwrap(), u64::MAX);
        assert_eq!(parse_knob_u64(" 4096\n").unwrap(), 4096);
        assert!(parse_knob_u64("lots").is_err());
    }

    #[test]
    fn knob_format_maps_unlimited_back() {
        assert_eq!(format_knob_u64(u64::MAX), "-1");
        assert_eq!(format_knob_u64(123), "123");
    }

    #[test]
    fn paths_compose_from_mount_and_rel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = fake_subsystem(dir.path());
        let cg = subsystem.cgroup("warden/a").child("b");
        assert_eq!(cg.rel_path(), "warden/a/b");
        assert_eq!(cg.path(), dir.path().join("memory/warden/a/b"));
        assert!(!cg.is_root());
        assert!(subsystem.root_cgroup().is_root());
    }

    #[test]
    fn create_is_idempotent_and_remove_tolerates_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = fake_subsystem(dir.path());
        let cg = subsystem.cgroup("warden/x");
        cg.create().unwrap();
        cg.create().unwrap();
        assert!(cg.exists());
        cg.remove().unwrap();
        cg.remove().unwrap();
        assert!(!cg.exists());
    }

    #[test]
    fn knob_roundtrip_through_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = fake_subsystem(dir.path());
        let cg = subsystem.cgroup("warden/y");
        cg.create().unwrap();
        cg.set_knob_u64("memory.limit_in_bytes", 1 << 20).unwrap();
        assert_eq!(cg.get_knob_u64("memory.limit_in_bytes").unwrap(), 1 << 20);
        assert!(cg.has_knob("memory.limit_in_bytes"));
        assert!(!cg.has_knob("memory.nope"));
    }

    #[test]
    fn pid_files_parse_one_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = fake_subsystem(dir.path());
        let cg = subsystem.cgroup("warden/z");
        cg.create().unwrap();
        cg.set_knob("tasks", "10\n20\n30\n").unwrap();
        let pids = cg.tasks().unwrap();
        assert_eq!(
            pids,
            vec![
                nix::unistd::Pid::from_raw(10),
                nix::unistd::Pid::from_raw(20),
                nix::unistd::Pid::from_raw(30),
            ]
        );
        assert!(!cg.is_empty());
    }

    #[test]
    fn unmounted_controller_probes_unsupported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subsystem = Subsystem::probe(SubsystemKind::Netcls, dir.path());
        assert!(!subsystem.supported());
    }
}
