//! System-wide constants and default paths.

/// Name of the absolute root container.
pub const ROOT_CONTAINER: &str = "/";

/// Name of the warden root container, parent of all client containers.
pub const WARDEN_ROOT_CONTAINER: &str = "/warden";

/// The `.` shorthand resolving to the caller's namespace root.
pub const DOT_CONTAINER: &str = ".";

/// Cgroup directory prefix for containers under every subsystem mount.
pub const CGROUP_PREFIX: &str = "warden";

/// Mount root of the v1 cgroup hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default control socket path.
pub const RPC_SOCKET: &str = "/run/wardend.sock";

/// Default configuration file path.
pub const CONFIG_PATH: &str = "/etc/wardend.conf";

/// Root of the persistent key-value store.
pub const KV_ROOT: &str = "/run/warden/kv";

/// Path of the master's saved pid/status map, used across self-upgrade.
pub const PIDMAP_PATH: &str = "/run/warden/pidmap";

/// Scratch directory for per-container chroot targets.
pub const TMP_DIR: &str = "/var/lib/warden/tmp";

/// Fixed fd number for the master→slave exit-status pipe in the slave.
pub const REAP_EVT_FD: i32 = 128;

/// Fixed fd number for the slave→master acknowledgement pipe in the slave.
pub const REAP_ACK_FD: i32 = 129;

/// Maximum length of a full container name.
pub const CONTAINER_NAME_MAX: usize = 128;

/// Maximum container tree depth.
pub const CONTAINER_DEPTH_MAX: usize = 16;

/// Highest container id the bitmap allocator will hand out.
pub const CONTAINER_ID_MAX: u32 = 16384;

/// Soft-limit floor for meta containers without running descendants.
pub const MEM_SOFT_LIMIT_FLOOR: u64 = 1024 * 1024;

/// Bytes of stdout/stderr returned by the tail data values.
pub const STDIO_READ_BYTES: u64 = 8 * 1024;
