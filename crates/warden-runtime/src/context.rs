//! Process-wide runtime context threaded through the holder.
//!
//! Subsystem handles are probed once at slave start and immutable
//! afterwards; configuration, the loop-device pool, the kv store, and the
//! statistics counters ride along so no component reaches for globals.

use std::path::Path;

use warden_common::config::WardenConfig;
use warden_common::error::Result;
use warden_core::cgroup::{Subsystem, SubsystemKind};
use warden_core::loopdev::LoopPool;
use warden_core::qos::TcHandle;
use warden_core::task::TaskEnv;

use crate::kv::KvStore;

/// The probed controller set, one handle per kernel subsystem.
#[derive(Debug)]
pub struct Subsystems {
    pub cpu: Subsystem,
    pub cpuacct: Subsystem,
    pub memory: Subsystem,
    pub freezer: Subsystem,
    pub blkio: Subsystem,
    pub devices: Subsystem,
    pub netcls: Subsystem,
}

impl Subsystems {
    /// Probes every controller under the given cgroup mount root.
    #[must_use]
    pub fn probe(cgroup_root: &Path) -> Self {
        Self {
            cpu: Subsystem::probe(SubsystemKind::Cpu, cgroup_root),
            cpuacct: Subsystem::probe(SubsystemKind::Cpuacct, cgroup_root),
            memory: Subsystem::probe(SubsystemKind::Memory, cgroup_root),
            freezer: Subsystem::probe(SubsystemKind::Freezer, cgroup_root),
            blkio: Subsystem::probe(SubsystemKind::Blkio, cgroup_root),
            devices: Subsystem::probe(SubsystemKind::Devices, cgroup_root),
            netcls: Subsystem::probe(SubsystemKind::Netcls, cgroup_root),
        }
    }

    /// Iterates the supported controllers in preparation order.
    pub fn supported(&self) -> impl Iterator<Item = &Subsystem> {
        [
            &self.cpu,
            &self.cpuacct,
            &self.memory,
            &self.freezer,
            &self.blkio,
            &self.devices,
            &self.netcls,
        ]
        .into_iter()
        .filter(|s| s.supported())
    }
}

/// Starts a container's primary process.
///
/// The holder talks to this trait so lifecycle logic can be exercised
/// without forking; the daemon installs the namespace-aware launcher
/// from `warden-core`.
pub trait Launcher {
    /// Launches the task described by `env` and returns its pid.
    ///
    /// # Errors
    ///
    /// Returns the launch-protocol error when the child cannot be set up
    /// or exec fails.
    fn launch(&self, env: &mut TaskEnv) -> Result<nix::unistd::Pid>;
}

/// The production launcher running the full namespace protocol.
#[derive(Debug, Default)]
pub struct NativeLauncher;

impl Launcher for NativeLauncher {
    fn launch(&self, env: &mut TaskEnv) -> Result<nix::unistd::Pid> {
        let mut task = warden_core::task::Task::new();
        task.start(env)?;
        task.pid().ok_or_else(|| {
            warden_common::error::WardenError::InvalidState(
                "launch reported success without a pid".into(),
            )
        })
    }
}

/// Daemon statistics counters, exposed through the root container.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Containers started since daemon start.
    pub started: u64,
    /// Containers respawned.
    pub respawns: u64,
    /// Errors logged.
    pub errors: u64,
}

/// Everything container operations need besides the tree itself.
pub struct RuntimeContext {
    /// Daemon configuration.
    pub config: WardenConfig,
    /// Probed controllers.
    pub subsystems: Subsystems,
    /// Loop devices held for image-backed roots.
    pub loop_pool: LoopPool,
    /// The persistent store; the slave is its only writer.
    pub kv: KvStore,
    /// Network QoS on/off, after `--nonet` is applied.
    pub network_enabled: bool,
    /// Task launcher.
    pub launcher: Box<dyn Launcher>,
    /// Daemon statistics.
    pub stats: Stats,
}

impl RuntimeContext {
    /// Builds the production context.
    ///
    /// # Errors
    ///
    /// Returns an error if the kv store cannot be opened.
    pub fn new(config: WardenConfig, cgroup_root: &Path, network_enabled: bool) -> Result<Self> {
        let kv = KvStore::open(&config.daemon.kv_root)?;
        Ok(Self {
            subsystems: Subsystems::probe(cgroup_root),
            loop_pool: LoopPool::new(),
            kv,
            network_enabled: network_enabled && config.network.enabled,
            launcher: Box::new(NativeLauncher),
            stats: Stats::default(),
            config,
        })
    }

    /// Handle of the root qdisc class all container classes descend from.
    #[must_use]
    pub fn root_tc_handle(&self) -> TcHandle {
        TcHandle::new(self.config.network.root_handle_major, 0)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("network_enabled", &self.network_enabled)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
