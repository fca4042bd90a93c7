//! Global configuration model for the warden daemon.
//!
//! All tunables live here with serde defaults, so a partial config file
//! only overrides what it names. `wardend -t <path>` validates a file
//! against this schema without starting the daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Container lifecycle timeouts and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// SIGTERM grace window before escalation, in milliseconds.
    pub kill_timeout_ms: u64,
    /// Overall bound on a stop operation, in milliseconds.
    pub stop_timeout_ms: u64,
    /// Delay before a dead container is respawned, in milliseconds.
    pub respawn_delay_ms: u64,
    /// Seconds a dead container lingers before aging removal.
    pub aging_wait_s: u64,
    /// Upper bound on stdout/stderr size before rotation truncates.
    pub max_log_size: u64,
    /// Interval between log-rotation sweeps, in milliseconds.
    pub rotate_interval_ms: u64,
    /// Scratch directory used for loop-mounted roots.
    pub tmp_dir: PathBuf,
    /// Whether memory.use_hierarchy is applied to new memory cgroups.
    pub use_hierarchy: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            kill_timeout_ms: 1_000,
            stop_timeout_ms: 5_000,
            respawn_delay_ms: 1_000,
            aging_wait_s: 60 * 60 * 24,
            max_log_size: 10 * 1024 * 1024,
            rotate_interval_ms: 60_000,
            tmp_dir: PathBuf::from(crate::constants::TMP_DIR),
            use_hierarchy: true,
        }
    }
}

/// Daemon-process level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
    /// Per-request read alarm for the slave, in seconds.
    pub read_timeout_s: u64,
    /// Path of the control socket.
    pub rpc_socket: PathBuf,
    /// Key-value store root directory.
    pub kv_root: PathBuf,
    /// Saved pid/status map used across master self-upgrade.
    pub pidmap_path: PathBuf,
    /// Delay before the master respawns a crashed slave, in milliseconds.
    pub slave_respawn_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            read_timeout_s: 5,
            rpc_socket: PathBuf::from(crate::constants::RPC_SOCKET),
            kv_root: PathBuf::from(crate::constants::KV_ROOT),
            pidmap_path: PathBuf::from(crate::constants::PIDMAP_PATH),
            slave_respawn_delay_ms: 1_000,
        }
    }
}

/// Network QoS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Master switch; `--nonet` forces this off.
    pub enabled: bool,
    /// Interfaces managed by the traffic-class tree; empty means all.
    pub interfaces: Vec<String>,
    /// Major number of the root qdisc handle.
    pub root_handle_major: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interfaces: Vec::new(),
            root_handle_major: 1,
        }
    }
}

/// Root configuration for the warden daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Container lifecycle settings.
    pub container: ContainerConfig,
    /// Daemon process settings.
    pub daemon: DaemonConfig,
    /// Network QoS settings.
    pub network: NetworkConfig,
}

impl WardenConfig {
    /// Loads configuration from a JSON file, falling back to defaults
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| WardenError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks internal consistency of the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.container.kill_timeout_ms == 0 {
            return Err(WardenError::InvalidValue(
                "container.kill_timeout_ms must be positive".into(),
            ));
        }
        if self.container.stop_timeout_ms < self.container.kill_timeout_ms {
            return Err(WardenError::InvalidValue(
                "container.stop_timeout_ms must not be below kill_timeout_ms".into(),
            ));
        }
        if self.daemon.max_clients == 0 {
            return Err(WardenError::InvalidValue(
                "daemon.max_clients must be positive".into(),
            ));
        }
        Ok(())
    }
}
