//! The container object, its state machine, and the tree operations.
//!
//! Containers live in an arena keyed by id ([`ContainerSet`]); parent and
//! child edges are plain ids, so no reference cycles exist and a lookup
//! after destroy simply misses. All state mutation happens on the event
//! loop thread.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use warden_common::constants::{CGROUP_PREFIX, MEM_SOFT_LIMIT_FLOOR};
use warden_common::error::{Result, WardenError};
use warden_common::types::{ContainerId, ContainerState, Cred};
use warden_core::cgroup::{blkio, cpu, devices, freezer, memory, netcls, Cgroup, Subsystem};
use warden_core::qos::TrafficClass;
use warden_core::task::{BindMount, TaskEnv};

use crate::context::RuntimeContext;
use crate::event::{Event, EventQueue};
use crate::property::{self, data, flags, names, PropertyMap, Value};

/// A waiter that must be answered because its container left *running*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Client token handed in at registration.
    pub token: u64,
    /// Full name of the container that changed state.
    pub name: String,
    /// The state it changed into.
    pub state: ContainerState,
}

/// Side effects of a tree operation the caller must carry out.
#[derive(Debug, Default)]
pub struct Actions {
    /// Waiters to answer.
    pub notified: Vec<Notification>,
    /// Exit statuses to acknowledge to the master.
    pub ack_pids: Vec<i32>,
}

/// One node of the container tree.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    name: String,
    pub(crate) state: ContainerState,
    owner: Cred,
    parent: Option<ContainerId>,
    pub(crate) children: Vec<ContainerId>,
    /// Typed attribute store.
    pub props: PropertyMap,
    pub(crate) exit_status: Option<i32>,
    pub(crate) start_errno: Option<i32>,
    pub(crate) oom_killed: bool,
    pub(crate) respawn_count: u64,
    pub(crate) death_time: Option<Instant>,
    running_children: u64,
    pub(crate) root_pid: Option<Pid>,
    pub(crate) oom_fd: Option<OwnedFd>,
    pub(crate) traffic_class: Option<TrafficClass>,
    loop_dev: Option<i32>,
    pub(crate) lost_and_restored: bool,
    /// State to restore on resume for containers paused through an
    /// ancestor.
    pre_pause: Option<ContainerState>,
    waiters: Vec<u64>,
}

impl Container {
    /// Creates a node in the *stopped* state.
    #[must_use]
    pub fn new(id: ContainerId, name: String, owner: Cred, parent: Option<ContainerId>) -> Self {
        Self {
            id,
            name,
            state: ContainerState::Stopped,
            owner,
            parent,
            children: Vec::new(),
            props: PropertyMap::new(),
            exit_status: None,
            start_errno: None,
            oom_killed: false,
            respawn_count: 0,
            death_time: None,
            running_children: 0,
            root_pid: None,
            oom_fd: None,
            traffic_class: None,
            loop_dev: None,
            lost_and_restored: false,
            pre_pause: None,
            waiters: Vec::new(),
        }
    }

    /// Container id.
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Full name, `/`-joined from the root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Owner credentials recorded at create.
    #[must_use]
    pub fn owner(&self) -> Cred {
        self.owner
    }

    /// Parent id; only the absolute root has none.
    #[must_use]
    pub fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    /// Ids of the children.
    #[must_use]
    pub fn children(&self) -> &[ContainerId] {
        &self.children
    }

    /// Pid of the primary task while one is attached.
    #[must_use]
    pub fn root_pid(&self) -> Option<Pid> {
        self.root_pid
    }

    /// Count of *running* descendants.
    #[must_use]
    pub fn running_children(&self) -> u64 {
        self.running_children
    }

    /// Respawns performed since the last explicit start.
    #[must_use]
    pub fn respawn_count(&self) -> u64 {
        self.respawn_count
    }

    /// True for the absolute root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id == ContainerId::ROOT
    }

    /// True for the warden root.
    #[must_use]
    pub fn is_warden_root(&self) -> bool {
        self.id == ContainerId::WARDEN_ROOT
    }

    /// True for either reserved root.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.id.is_reserved()
    }

    /// Whether the caller may operate on this container.
    ///
    /// # Errors
    ///
    /// Returns `permission` when the caller is neither privileged nor
    /// the owner.
    pub fn check_permission(&self, caller: Cred) -> Result<()> {
        if caller.is_privileged() || self.is_reserved() || self.owner == caller {
            Ok(())
        } else {
            Err(WardenError::Permission(format!(
                "{} is not the owner of {}",
                caller, self.name
            )))
        }
    }

    /// Relative cgroup path of this container under any subsystem.
    #[must_use]
    pub fn cgroup_rel(&self) -> String {
        if self.is_root() {
            String::new()
        } else if self.is_warden_root() {
            CGROUP_PREFIX.to_string()
        } else {
            format!("{CGROUP_PREFIX}/{}", self.name)
        }
    }

    /// The leaf cgroup under one subsystem.
    #[must_use]
    pub fn leaf_cgroup<'a>(&self, subsystem: &'a Subsystem) -> Cgroup<'a> {
        subsystem.cgroup(&self.cgroup_rel())
    }

    /// Raw fd of the armed OOM eventfd, when armed.
    #[must_use]
    pub fn oom_fd(&self) -> Option<RawFd> {
        self.oom_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// True when the armed OOM eventfd has fired.
    #[must_use]
    pub fn oom_fd_triggered(&self) -> bool {
        self.oom_fd
            .as_ref()
            .is_some_and(memory::oom_fd_triggered)
    }

    /// Scratch directory used as chroot target for image roots.
    #[must_use]
    pub fn tmp_dir(&self, ctx: &RuntimeContext) -> PathBuf {
        ctx.config.container.tmp_dir.join(self.id.to_string())
    }

    fn default_stdio_path(&self, ctx: &RuntimeContext, stream: &str) -> PathBuf {
        self.tmp_dir(ctx).join(stream)
    }

    /// Effective stdout path.
    #[must_use]
    pub fn stdout_path(&self, ctx: &RuntimeContext) -> PathBuf {
        let configured = self.props.get_string(names::STDOUT_PATH);
        if configured.is_empty() {
            self.default_stdio_path(ctx, "stdout")
        } else {
            PathBuf::from(configured)
        }
    }

    /// Effective stderr path.
    #[must_use]
    pub fn stderr_path(&self, ctx: &RuntimeContext) -> PathBuf {
        let configured = self.props.get_string(names::STDERR_PATH);
        if configured.is_empty() {
            self.default_stdio_path(ctx, "stderr")
        } else {
            PathBuf::from(configured)
        }
    }

    /// Stored data value, for the entries that live on the object.
    ///
    /// # Errors
    ///
    /// Returns `invalid-data` for names served elsewhere.
    pub fn stored_data(&self, name: &str) -> Result<Value> {
        match name {
            data::STATE => Ok(Value::Str(self.state.to_string())),
            data::EXIT_STATUS => Ok(Value::Int(i64::from(self.exit_status.unwrap_or(-1)))),
            data::START_ERRNO => Ok(Value::Int(i64::from(self.start_errno.unwrap_or(-1)))),
            data::OOM_KILLED => Ok(Value::Bool(self.oom_killed)),
            data::RESPAWN_COUNT => Ok(Value::Uint(self.respawn_count)),
            data::ROOT_PID => Ok(Value::Int(i64::from(
                self.root_pid.map_or(0, Pid::as_raw),
            ))),
            data::DEATH_TIME => Ok(Value::Uint(
                self.death_time
                    .map_or(0, |t| t.elapsed().as_secs()),
            )),
            other => Err(WardenError::InvalidData(other.to_string())),
        }
    }

    /// Applies every dynamic property to the live cgroups.
    ///
    /// # Errors
    ///
    /// Returns the first subsystem error; EBUSY on the memory limit is
    /// already mapped to `invalid-value` by the driver.
    pub fn apply_dynamic_properties(&self, ctx: &RuntimeContext) -> Result<()> {
        let subsystems = &ctx.subsystems;
        if subsystems.memory.supported() {
            let memcg = self.leaf_cgroup(&subsystems.memory);
            if let Err(e) = memory::use_hierarchy(&memcg, ctx.config.container.use_hierarchy) {
                // Tolerated: the knob is refused once the cgroup has
                // children, which happens when a config switch changes
                // the setting on a live tree.
                tracing::warn!(container = %self.name, error = %e, "use_hierarchy not applied");
            }
            memory::set_guarantee(&memcg, self.props.get_uint(names::MEMORY_GUARANTEE))?;
            memory::set_limit(&memcg, self.props.get_uint(names::MEMORY_LIMIT))?;
            memory::recharge_on_pgfault(
                &memcg,
                self.props.get_bool(names::RECHARGE_ON_PGFAULT),
            )?;
            memory::set_io_limit(&memcg, self.props.get_uint(names::IO_LIMIT))?;
        }
        if subsystems.cpu.supported() {
            let cpucg = self.leaf_cgroup(&subsystems.cpu);
            let policy = self.props.get_string(names::CPU_POLICY);
            cpu::set_policy(&cpucg, &policy)?;
            if policy == "normal" {
                cpu::set_limit(&cpucg, self.props.get_uint(names::CPU_LIMIT))?;
                cpu::set_guarantee(&cpucg, self.props.get_uint(names::CPU_GUARANTEE))?;
            }
        }
        if subsystems.blkio.supported() {
            let blkcg = self.leaf_cgroup(&subsystems.blkio);
            blkio::set_policy(&blkcg, self.props.get_string(names::IO_POLICY) == "batch")?;
        }
        Ok(())
    }

    /// Prepares the traffic class, leaf cgroups, OOM monitor, and device
    /// allowlist, in that order.
    ///
    /// # Errors
    ///
    /// Returns the first preparation error; the caller is expected to
    /// call [`Container::free_resources`] on failure.
    pub fn prepare_resources(
        &mut self,
        ctx: &mut RuntimeContext,
        parent_tc: Option<&TrafficClass>,
    ) -> Result<()> {
        if ctx.network_enabled {
            let parent_handle =
                parent_tc.map_or_else(|| ctx.root_tc_handle(), |tc| tc.handle());
            let mut class = TrafficClass::for_container(parent_handle, self.id.0)?;
            class.configure(
                self.uint_map(names::NET_PRIORITY),
                self.uint_map(names::NET_GUARANTEE),
                self.uint_map(names::NET_LIMIT),
            )?;
            self.traffic_class = Some(class);
        }

        for subsystem in ctx.subsystems.supported() {
            self.leaf_cgroup(subsystem).create()?;
        }

        if ctx.network_enabled && ctx.subsystems.netcls.supported() {
            if let Some(class) = &self.traffic_class {
                netcls::set_classid(
                    &self.leaf_cgroup(&ctx.subsystems.netcls),
                    class.handle().0,
                )?;
            }
        }

        if !self.is_root() {
            self.apply_dynamic_properties(ctx)?;
        }

        if !self.is_reserved() {
            if ctx.subsystems.memory.supported() {
                let memcg = self.leaf_cgroup(&ctx.subsystems.memory);
                self.oom_fd = Some(memory::arm_oom_notification(&memcg)?);
            }
            if ctx.subsystems.devices.supported() {
                let list = self.string_list(names::ALLOWED_DEVICES);
                devices::apply_allowlist(&self.leaf_cgroup(&ctx.subsystems.devices), &list)?;
            }
        }
        Ok(())
    }

    /// Releases every resource acquired for a run. Never fails; partial
    /// failures are logged and the teardown continues.
    pub fn free_resources(&mut self, ctx: &mut RuntimeContext) {
        self.oom_fd = None;

        for subsystem in ctx.subsystems.supported() {
            let cg = self.leaf_cgroup(subsystem);
            if let Err(e) = cg.remove() {
                tracing::warn!(container = %self.name, cgroup = %cg, error = %e, "cgroup removal failed");
            }
        }

        self.traffic_class = None;

        if let Some(nr) = self.loop_dev.take() {
            if let Err(e) = ctx.loop_pool.release(nr) {
                tracing::warn!(container = %self.name, device = nr, error = %e, "loop device release failed");
            }
            let _ = self
                .props
                .set_value(names::RAW_LOOP_DEV, Value::Int(-1), Some(&ctx.kv.node(self.id)));
        }
        self.root_pid = None;
    }

    /// Builds the launch environment from the property map.
    ///
    /// # Errors
    ///
    /// Returns property or loop-device errors; on error no loop device is
    /// left allocated.
    pub fn prepare_task_env(&mut self, ctx: &mut RuntimeContext) -> Result<TaskEnv> {
        let mut env = TaskEnv {
            command: self.props.get_string(names::COMMAND),
            cwd: PathBuf::from(self.props.get_string(names::CWD)),
            root: PathBuf::from(self.props.get_string(names::ROOT)),
            root_read_only: self.props.get_bool(names::ROOT_READONLY),
            user: self.props.get_string(names::USER),
            environ: self.string_list(names::ENV),
            hostname: self.props.get_string(names::HOSTNAME),
            stdout_path: self.stdout_path(ctx),
            stderr_path: self.stderr_path(ctx),
            ..TaskEnv::default()
        };

        // An image root needs a loop device and the scratch dir as the
        // actual chroot target.
        if env.root != PathBuf::from("/") && !env.root.is_dir() {
            let image = env.root.clone();
            let nr = ctx.loop_pool.acquire(&image)?;
            if let Err(e) = self.props.set_value(
                names::RAW_LOOP_DEV,
                Value::Int(i64::from(nr)),
                Some(&ctx.kv.node(self.id)),
            ) {
                let _ = ctx.loop_pool.release(nr);
                return Err(e);
            }
            self.loop_dev = Some(nr);
            env.root = self.tmp_dir(ctx);
        }

        for entry in self.string_list(names::BIND) {
            let words: Vec<&str> = entry.split_whitespace().collect();
            if words.len() >= 2 {
                env.binds.push(BindMount {
                    source: PathBuf::from(words[0]),
                    target: PathBuf::from(words[1]),
                    read_only: words.get(2) == Some(&"ro"),
                });
            }
        }

        for entry in self.string_list(names::ULIMIT) {
            env.ulimits.push(warden_core::task::parse_ulimit(&entry)?);
        }

        if let Some(parent) = env.stdout_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
        }

        env.cgroup_procs = ctx
            .subsystems
            .supported()
            .map(|s| self.leaf_cgroup(s).path().join("cgroup.procs"))
            .collect();

        env.prepare(&self.name)?;
        Ok(env)
    }

    /// Kill protocol steps 1–3: SIGTERM, bounded wait, freeze + SIGKILL +
    /// thaw.
    ///
    /// # Errors
    ///
    /// Returns an error when the task list cannot be read.
    pub fn kill_all(&self, ctx: &RuntimeContext) -> Result<()> {
        tracing::info!(container = %self.name, "killing all tasks");
        if !ctx.subsystems.freezer.supported() {
            if let Some(pid) = self.root_pid {
                match nix::sys::signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => return Err(WardenError::errno(format!("kill({pid})"), e)),
                }
            }
            return Ok(());
        }

        let cg = self.leaf_cgroup(&ctx.subsystems.freezer);
        cg.kill_all(Signal::SIGTERM)?;

        let graceful = sleep_while(
            Duration::from_millis(ctx.config.container.kill_timeout_ms),
            || !cg.is_empty(),
        );
        if !graceful {
            tracing::info!(container = %self.name, "tasks survived SIGTERM, escalating");
        }

        // Freeze so nothing forks between enumeration and SIGKILL.
        if let Err(e) = freezer::freeze(&cg) {
            tracing::warn!(container = %self.name, error = %e, "freeze before SIGKILL failed");
        }
        cg.kill_all(Signal::SIGKILL)?;
        if let Err(e) = freezer::thaw(&cg) {
            tracing::warn!(container = %self.name, error = %e, "thaw after SIGKILL failed");
        }
        Ok(())
    }

    /// Kill protocol step 4: wait for the root task to vanish.
    ///
    /// # Errors
    ///
    /// Exceeding `stop_timeout_ms` is fatal to the stop call.
    pub fn wait_stopped(&self, ctx: &RuntimeContext) -> Result<()> {
        let freezer_ok = ctx.subsystems.freezer.supported();
        let cg = self.leaf_cgroup(&ctx.subsystems.freezer);
        let pid = self.root_pid;
        let done = sleep_while(
            Duration::from_millis(ctx.config.container.stop_timeout_ms),
            || {
                if freezer_ok && cg.is_empty() {
                    return false;
                }
                match pid {
                    Some(pid) => nix::sys::signal::kill(pid, None).is_ok(),
                    None => false,
                }
            },
        );
        if done {
            Ok(())
        } else {
            Err(WardenError::errno(
                format!(
                    "container {} did not stop in {}ms",
                    self.name, ctx.config.container.stop_timeout_ms
                ),
                nix::errno::Errno::ETIMEDOUT,
            ))
        }
    }

    /// Pids currently charged to the container's freezer cgroup.
    #[must_use]
    pub fn processes(&self, ctx: &RuntimeContext) -> Vec<Pid> {
        if !ctx.subsystems.freezer.supported() {
            return Vec::new();
        }
        self.leaf_cgroup(&ctx.subsystems.freezer)
            .procs()
            .unwrap_or_default()
    }

    /// Whether the respawn policy allows another restart now.
    #[must_use]
    pub fn may_respawn(&self) -> bool {
        if self.state != ContainerState::Dead || !self.props.get_bool(names::RESPAWN) {
            return false;
        }
        let max = match self.props.get(names::MAX_RESPAWNS) {
            Ok(Value::Int(v)) => v,
            _ => -1,
        };
        max < 0 || self.respawn_count < max.unsigned_abs()
    }

    /// True once the dead container outlived its aging window.
    #[must_use]
    pub fn aged_out(&self) -> bool {
        self.state == ContainerState::Dead
            && self.death_time.is_some_and(|t| {
                t.elapsed().as_secs() >= self.props.get_uint(names::AGING_TIME)
            })
    }

    fn string_list(&self, name: &str) -> Vec<String> {
        match self.props.get(name) {
            Ok(Value::List(items)) => items,
            _ => Vec::new(),
        }
    }

    fn uint_map(&self, name: &str) -> HashMap<String, u64> {
        match self.props.get(name) {
            Ok(Value::UintMap(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Polls `cond` with a short sleep until it turns false or the timeout
/// elapses; returns true when the condition cleared in time.
fn sleep_while(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Arena of containers keyed by id, owner of the tree edges.
#[derive(Debug, Default)]
pub struct ContainerSet {
    map: HashMap<ContainerId, Container>,
}

impl ContainerSet {
    /// An empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no container exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates the live containers in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Container> {
        self.map.values()
    }

    /// Inserts a node and links it to its parent.
    pub fn insert(&mut self, container: Container) {
        let id = container.id;
        let parent = container.parent;
        self.map.insert(id, container);
        if let Some(parent) = parent {
            if let Some(node) = self.map.get_mut(&parent) {
                node.children.push(id);
            }
        }
    }

    /// Immutable node access.
    ///
    /// # Errors
    ///
    /// Returns `container-does-not-exist` for an unknown id.
    pub fn node(&self, id: ContainerId) -> Result<&Container> {
        self.map
            .get(&id)
            .ok_or_else(|| WardenError::ContainerDoesNotExist(format!("id {id}")))
    }

    /// Mutable node access.
    ///
    /// # Errors
    ///
    /// Returns `container-does-not-exist` for an unknown id.
    pub fn node_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.map
            .get_mut(&id)
            .ok_or_else(|| WardenError::ContainerDoesNotExist(format!("id {id}")))
    }

    /// Ancestor chain of a node, nearest first.
    #[must_use]
    pub fn ancestors(&self, id: ContainerId) -> Vec<ContainerId> {
        let mut chain = Vec::new();
        let mut cursor = self.map.get(&id).and_then(|c| c.parent);
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.map.get(&parent).and_then(|c| c.parent);
        }
        chain
    }

    /// Registers a state-change waiter; answers immediately when the
    /// container is not *running*.
    pub fn add_waiter(&mut self, id: ContainerId, token: u64, actions: &mut Actions) {
        let Some(node) = self.map.get_mut(&id) else {
            return;
        };
        if node.state == ContainerState::Running {
            node.waiters.push(token);
        } else {
            actions.notified.push(Notification {
                token,
                name: node.name.clone(),
                state: node.state,
            });
        }
    }

    /// Changes a node's state, maintaining the `running_children` chain,
    /// persistence, and waiter notification.
    pub fn set_state(
        &mut self,
        ctx: &RuntimeContext,
        id: ContainerId,
        new_state: ContainerState,
        actions: &mut Actions,
    ) {
        let Some(node) = self.map.get_mut(&id) else {
            return;
        };
        let old_state = node.state;
        if old_state == new_state {
            return;
        }
        tracing::info!(container = %node.name, from = %old_state, to = %new_state, "state change");
        node.state = new_state;

        let kv_node = ctx.kv.node(id);
        if let Err(e) = kv_node.set(data::STATE, &new_state.to_string()) {
            tracing::error!(container = %node.name, error = %e, "state not persisted");
        }

        if new_state != ContainerState::Running {
            let name = node.name.clone();
            for token in node.waiters.drain(..) {
                actions.notified.push(Notification {
                    token,
                    name: name.clone(),
                    state: new_state,
                });
            }
        }

        let delta: i64 = match (old_state == ContainerState::Running, new_state == ContainerState::Running)
        {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        if delta != 0 {
            self.update_running_children(id, delta);
        }
    }

    fn update_running_children(&mut self, id: ContainerId, delta: i64) {
        let mut cursor = self.map.get(&id).and_then(|c| c.parent);
        while let Some(parent) = cursor {
            if let Some(node) = self.map.get_mut(&parent) {
                node.running_children = node.running_children.saturating_add_signed(delta);
                cursor = node.parent;
            } else {
                break;
            }
        }
    }

    /// Re-applies the meta soft-limit policy along the ancestor walk: a
    /// meta container with running descendants gets the default soft
    /// limit, one without gets a tiny floor so the OOM killer prefers it.
    pub fn update_soft_limits(&self, ctx: &RuntimeContext, id: ContainerId) {
        if !ctx.subsystems.memory.supported() {
            return;
        }
        let default_limit = memory::soft_limit(&ctx.subsystems.memory.root_cgroup())
            .unwrap_or(u64::MAX);

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.map.get(&current) else {
                break;
            };
            if !node.is_reserved() && node.state == ContainerState::Meta {
                let want = if node.running_children > 0 {
                    default_limit
                } else {
                    MEM_SOFT_LIMIT_FLOOR
                };
                let cg = node.leaf_cgroup(&ctx.subsystems.memory);
                match memory::soft_limit(&cg) {
                    Ok(current_limit) if current_limit == want => {}
                    _ => {
                        if let Err(e) = memory::set_soft_limit(&cg, want) {
                            tracing::warn!(container = %node.name, error = %e, "soft limit not applied");
                        }
                    }
                }
            }
            cursor = node.parent;
        }
    }

    /// Sum of a hierarchical property over a node's children; a child
    /// without an explicit value contributes its own children's sum.
    #[must_use]
    pub fn children_sum(
        &self,
        id: ContainerId,
        prop: &str,
        replace: Option<(ContainerId, u64)>,
    ) -> u64 {
        let Some(node) = self.map.get(&id) else {
            return 0;
        };
        let mut total = 0_u64;
        for &child_id in &node.children {
            if let Some((replaced, value)) = replace {
                if replaced == child_id {
                    total = total.saturating_add(value);
                    continue;
                }
            }
            let Some(child) = self.map.get(&child_id) else {
                continue;
            };
            let own = child.props.get_uint(prop);
            if own != 0 {
                total = total.saturating_add(own);
            } else {
                total = total.saturating_add(self.children_sum(child_id, prop, replace));
            }
        }
        total
    }

    /// Validates the hierarchy invariant for a proposed property value:
    /// children's sum stays within it, it stays within every ancestor
    /// cap, and the parent's children-sum with this value substituted
    /// stays within the parent's cap.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` naming the violated bound.
    pub fn validate_hierarchical(
        &self,
        id: ContainerId,
        prop: &str,
        value: u64,
    ) -> Result<()> {
        if value == 0 {
            return Ok(());
        }

        let children = self.children_sum(id, prop, None);
        if children != 0 && value < children {
            return Err(WardenError::InvalidValue(format!(
                "{prop} below children's total {children}"
            )));
        }

        for ancestor_id in self.ancestors(id) {
            let Some(ancestor) = self.map.get(&ancestor_id) else {
                continue;
            };
            let cap = ancestor.props.get_uint(prop);
            if cap != 0 && value > cap {
                return Err(WardenError::InvalidValue(format!(
                    "{prop} exceeds {} set on {}",
                    cap, ancestor.name
                )));
            }
        }

        if let Some(parent_id) = self.map.get(&id).and_then(|c| c.parent) {
            let Some(parent) = self.map.get(&parent_id) else {
                return Ok(());
            };
            let cap = parent.props.get_uint(prop);
            if cap != 0 {
                let siblings = self.children_sum(parent_id, prop, Some((id, value)));
                if siblings > cap {
                    return Err(WardenError::InvalidValue(format!(
                        "{prop} makes children of {} exceed {cap}",
                        parent.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Starts a container: validates, prepares resources, launches the
    /// task unless the command is empty, and transitions to *running* or
    /// *meta*.
    ///
    /// # Errors
    ///
    /// `invalid-state` outside *stopped* or with a non-ready parent; any
    /// preparation error after freeing the partial resources.
    pub fn start(
        &mut self,
        ctx: &mut RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<()> {
        let state = self.node(id)?.state();
        if state != ContainerState::Stopped {
            return Err(WardenError::InvalidState(format!(
                "cannot start from {state}"
            )));
        }
        if let Some(parent_id) = self.node(id)?.parent() {
            let parent = self.node(parent_id)?;
            if !matches!(
                parent.state(),
                ContainerState::Running | ContainerState::Meta
            ) {
                return Err(WardenError::InvalidState(format!(
                    "parent {} is {}",
                    parent.name(),
                    parent.state()
                )));
            }
        }
        for ancestor_id in self.ancestors(id) {
            let ancestor = self.node(ancestor_id)?;
            if ancestor.state() == ContainerState::Paused {
                return Err(WardenError::InvalidState(format!(
                    "ancestor {} is paused",
                    ancestor.name()
                )));
            }
        }

        // Unprivileged owners lose their overrides when starting under a
        // VM-like parent.
        let os_mode = self.node(id)?.props.get_string(names::VIRT_MODE) == "os";
        if os_mode && !self.node(id)?.owner().is_privileged() {
            let kv_node = ctx.kv.node(id);
            let node = self.node_mut(id)?;
            for def in property::schema() {
                if def.has_flag(flags::OS_MODE) && !node.props.is_default(def.name) {
                    let _ = node.props.reset(def.name, Some(&kv_node));
                }
            }
        }

        // Sibling state may have shifted since the values were accepted.
        for prop in property::HIERARCHICAL {
            let value = self.node(id)?.props.get_uint(prop);
            self.validate_hierarchical(id, prop, value)?;
        }

        let meta = self.node(id)?.props.get_string(names::COMMAND).is_empty();
        let parent_tc = self
            .node(id)?
            .parent()
            .and_then(|pid| self.map.get(&pid))
            .and_then(|p| p.traffic_class.clone());

        {
            let node = self.node_mut(id)?;
            tracing::info!(container = %node.name, id = %id, meta, "start");
            node.exit_status = None;
            node.oom_killed = false;
            node.respawn_count = 0;
            node.lost_and_restored = false;

            if let Err(e) = node.prepare_resources(ctx, parent_tc.as_ref()) {
                node.free_resources(ctx);
                return Err(e);
            }
        }

        if !meta {
            let launch = {
                let node = self.node_mut(id)?;
                node.prepare_task_env(ctx)
                    .and_then(|mut env| ctx.launcher.launch(&mut env))
            };
            match launch {
                Ok(pid) => {
                    let kv_node = ctx.kv.node(id);
                    let node = self.node_mut(id)?;
                    node.root_pid = Some(pid);
                    node.start_errno = None;
                    node.props.set_value(
                        names::RAW_ROOT_PID,
                        Value::Int(i64::from(pid.as_raw())),
                        Some(&kv_node),
                    )?;
                    tracing::info!(container = %node.name, pid = pid.as_raw(), "task started");
                }
                Err(e) => {
                    let node = self.node_mut(id)?;
                    node.start_errno = e.raw_errno();
                    node.free_resources(ctx);
                    return Err(e);
                }
            }
        }

        let new_state = if meta {
            ContainerState::Meta
        } else {
            ContainerState::Running
        };
        self.set_state(ctx, id, new_state, actions);
        ctx.stats.started += 1;
        self.update_soft_limits(ctx, id);
        Ok(())
    }

    /// Stops a container and its subtree, children first.
    ///
    /// # Errors
    ///
    /// `invalid-state` from *stopped* or *paused*; kill-protocol errors.
    pub fn stop(
        &mut self,
        ctx: &mut RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<()> {
        let state = self.node(id)?.state();
        if matches!(state, ContainerState::Stopped | ContainerState::Paused) {
            return Err(WardenError::InvalidState(format!(
                "cannot stop from {state}"
            )));
        }

        let children = self.node(id)?.children().to_vec();
        for child in children {
            let child_state = self.node(child)?.state();
            if child_state != ContainerState::Stopped {
                if let Err(e) = self.stop(ctx, child, actions) {
                    tracing::error!(error = %e, "child stop failed");
                }
            }
        }

        {
            let node = self.node_mut(id)?;
            tracing::info!(container = %node.name, id = %id, "stop");
            node.oom_fd = None;

            if node.root_pid.is_some() {
                node.kill_all(ctx)?;
                node.wait_stopped(ctx)?;
            }
        }

        if !self.node(id)?.is_reserved() {
            let kv_node = ctx.kv.node(id);
            let node = self.node_mut(id)?;
            node.props
                .set_value(names::RAW_ROOT_PID, Value::Int(0), Some(&kv_node))?;
            node.death_time = None;
            node.pre_pause = None;
            self.set_state(ctx, id, ContainerState::Stopped, actions);
            self.node_mut(id)?.free_resources(ctx);
        }
        self.update_soft_limits(ctx, id);
        Ok(())
    }

    /// Freezes a running container and marks its running subtree paused.
    ///
    /// # Errors
    ///
    /// `invalid-state` outside *running*; freezer errors.
    pub fn pause(
        &mut self,
        ctx: &RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<()> {
        let state = self.node(id)?.state();
        if state != ContainerState::Running {
            return Err(WardenError::InvalidState(format!(
                "cannot pause from {state}"
            )));
        }

        if ctx.subsystems.freezer.supported() {
            let node = self.node(id)?;
            freezer::freeze(&node.leaf_cgroup(&ctx.subsystems.freezer))?;
        }

        for target in self.subtree(id) {
            let state = self.node(target)?.state();
            if target == id
                || matches!(state, ContainerState::Running | ContainerState::Meta)
            {
                self.node_mut(target)?.pre_pause = Some(state);
                self.set_state(ctx, target, ContainerState::Paused, actions);
            }
        }
        Ok(())
    }

    /// Thaws a paused container and restores the subtree's prior states.
    ///
    /// # Errors
    ///
    /// `invalid-state` outside *paused* or under a paused ancestor.
    pub fn resume(
        &mut self,
        ctx: &RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<()> {
        let state = self.node(id)?.state();
        if state != ContainerState::Paused {
            return Err(WardenError::InvalidState(format!(
                "cannot resume from {state}"
            )));
        }
        for ancestor_id in self.ancestors(id) {
            let ancestor = self.node(ancestor_id)?;
            if ancestor.state() == ContainerState::Paused {
                return Err(WardenError::InvalidState(format!(
                    "ancestor {} is paused",
                    ancestor.name()
                )));
            }
        }

        if ctx.subsystems.freezer.supported() {
            let node = self.node(id)?;
            freezer::thaw(&node.leaf_cgroup(&ctx.subsystems.freezer))?;
        }

        for target in self.subtree(id) {
            if self.node(target)?.state() == ContainerState::Paused {
                let restored = self
                    .node_mut(target)?
                    .pre_pause
                    .take()
                    .unwrap_or(ContainerState::Running);
                self.set_state(ctx, target, restored, actions);
            }
        }
        Ok(())
    }

    /// Signals the primary task of a running container.
    ///
    /// # Errors
    ///
    /// `invalid-state` outside *running*; the kill errno.
    pub fn kill(&self, id: ContainerId, signal: Signal) -> Result<()> {
        let node = self.node(id)?;
        if node.state() != ContainerState::Running {
            return Err(WardenError::InvalidState(format!(
                "cannot kill from {}",
                node.state()
            )));
        }
        let pid = node.root_pid.ok_or_else(|| {
            WardenError::InvalidState("container has no task".into())
        })?;
        tracing::info!(container = %node.name, signal = %signal, "kill");
        nix::sys::signal::kill(pid, signal)
            .map_err(|e| WardenError::errno(format!("kill({pid})"), e))
    }

    /// Handles task termination: transitions to *dead*, persists the
    /// status, cleans up siblings when required, and schedules a respawn
    /// when the policy allows.
    ///
    /// Returns false when the event was bogus and should be re-delivered
    /// later (live processes remain in an isolated container).
    pub fn exit(
        &mut self,
        ctx: &mut RuntimeContext,
        queue: &mut EventQueue,
        id: ContainerId,
        status: i32,
        oom_killed: bool,
        actions: &mut Actions,
    ) -> bool {
        let Ok(node) = self.node(id) else {
            return true;
        };
        let isolate = node.props.get_bool(names::ISOLATE);
        if !oom_killed && isolate && !node.processes(ctx).is_empty() {
            tracing::warn!(container = %node.name, status, "bogus exit event, tasks remain");
            return true;
        }

        let pid = node.root_pid.map(Pid::as_raw);
        tracing::info!(container = %node.name, status, oom_killed, "task exited");

        let kv_node = ctx.kv.node(id);
        if let Ok(node) = self.node_mut(id) {
            node.oom_fd = None;
            node.exit_status = Some(status);
            node.oom_killed = oom_killed;
            node.death_time = Some(Instant::now());
            node.root_pid = None;
            let _ = node.props.set_value(names::RAW_ROOT_PID, Value::Int(0), Some(&kv_node));
            if let Err(e) = kv_node.set(data::EXIT_STATUS, &status.to_string()) {
                tracing::error!(error = %e, "exit status not persisted");
            }
            let _ = kv_node.set(data::OOM_KILLED, if oom_killed { "true" } else { "false" });
        }
        self.set_state(ctx, id, ContainerState::Dead, actions);

        let need_sweep = oom_killed || !isolate;
        if need_sweep {
            if let Ok(node) = self.node(id) {
                if let Err(e) = node.kill_all(ctx) {
                    tracing::warn!(error = %e, "sibling task sweep failed");
                }
            }
        }

        // Children that lost their namespace holder go down with it.
        let children = self
            .node(id)
            .map(|n| n.children().to_vec())
            .unwrap_or_default();
        for child in children {
            let child_state = self.node(child).map(Container::state);
            if matches!(
                child_state,
                Ok(ContainerState::Running | ContainerState::Meta)
            ) {
                if let Ok(node) = self.node(child) {
                    let _ = node.kill_all(ctx);
                }
                self.exit(ctx, queue, child, status, oom_killed, actions);
            }
        }

        if self.node(id).map(|n| n.may_respawn()).unwrap_or(false) {
            queue.add(
                Duration::from_millis(ctx.config.container.respawn_delay_ms),
                Event::Respawn(id),
            );
        }

        if let Some(pid) = pid {
            actions.ack_pids.push(pid);
        }
        true
    }

    /// Respawns a dead container: stop, start, bump the counter.
    ///
    /// # Errors
    ///
    /// Propagates stop/start failures.
    pub fn respawn(
        &mut self,
        ctx: &mut RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<()> {
        let count = self.node(id)?.respawn_count;
        self.stop(ctx, id, actions)?;
        let result = self.start(ctx, id, actions);
        {
            let kv_node = ctx.kv.node(id);
            let node = self.node_mut(id)?;
            node.respawn_count = count + 1;
            let _ = kv_node.set(data::RESPAWN_COUNT, &node.respawn_count.to_string());
        }
        ctx.stats.respawns += 1;
        result
    }

    /// Removes a container and its subtree: resumes if paused, stops if
    /// not stopped, deletes kv nodes, unlinks from the parent.
    ///
    /// Returns the removed ids so the holder can drop its indexes.
    ///
    /// # Errors
    ///
    /// Propagates resume/stop failures; kv removal is best-effort.
    pub fn destroy(
        &mut self,
        ctx: &mut RuntimeContext,
        id: ContainerId,
        actions: &mut Actions,
    ) -> Result<Vec<ContainerId>> {
        {
            let node = self.node(id)?;
            tracing::info!(container = %node.name, id = %id, "destroy");
        }

        if self.node(id)?.state() == ContainerState::Paused {
            self.resume(ctx, id, actions)?;
        }
        if self.node(id)?.state() != ContainerState::Stopped {
            self.stop(ctx, id, actions)?;
        }

        let mut removed = Vec::new();
        let children = self.node(id)?.children().to_vec();
        for child in children {
            removed.extend(self.destroy(ctx, child, actions)?);
        }

        if let Err(e) = ctx.kv.node(id).remove() {
            tracing::error!(id = %id, error = %e, "kv node removal failed");
        }

        if let Some(node) = self.map.remove(&id) {
            if let Some(parent) = node.parent {
                if let Some(parent_node) = self.map.get_mut(&parent) {
                    parent_node.children.retain(|&c| c != id);
                }
            }
        }
        removed.push(id);
        Ok(removed)
    }

    /// Ids of a node's subtree in breadth-first order, the node first.
    #[must_use]
    pub fn subtree(&self, id: ContainerId) -> Vec<ContainerId> {
        let mut order = vec![id];
        let mut cursor = 0;
        while cursor < order.len() {
            if let Some(node) = self.map.get(&order[cursor]) {
                order.extend(node.children.iter().copied());
            }
            cursor += 1;
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::constants::{ROOT_CONTAINER, WARDEN_ROOT_CONTAINER};

    #[test]
    fn cgroup_rel_paths() {
        let root = Container::new(ContainerId::ROOT, ROOT_CONTAINER.into(), Cred::root(), None);
        let warden_root = Container::new(
            ContainerId::WARDEN_ROOT,
            WARDEN_ROOT_CONTAINER.into(),
            Cred::root(),
            Some(ContainerId::ROOT),
        );
        let leaf = Container::new(
            ContainerId(3),
            "a/b".into(),
            Cred::root(),
            Some(ContainerId::WARDEN_ROOT),
        );
        assert_eq!(root.cgroup_rel(), "");
        assert_eq!(warden_root.cgroup_rel(), "warden");
        assert_eq!(leaf.cgroup_rel(), "warden/a/b");
    }

    #[test]
    fn permission_checks() {
        let owner = Cred::new(1000, 1000);
        let node = Container::new(ContainerId(3), "a".into(), owner, None);
        node.check_permission(owner).unwrap();
        node.check_permission(Cred::root()).unwrap();
        assert!(node.check_permission(Cred::new(1001, 1001)).is_err());
    }

    #[test]
    fn respawn_budget_respects_max() {
        let mut node = Container::new(ContainerId(3), "a".into(), Cred::root(), None);
        node.state = ContainerState::Dead;
        node.props
            .set_from_string(names::RESPAWN, "true", None)
            .unwrap();
        node.props
            .set_from_string(names::MAX_RESPAWNS, "2", None)
            .unwrap();
        assert!(node.may_respawn());
        node.respawn_count = 2;
        assert!(!node.may_respawn());
        node.props
            .set_from_string(names::MAX_RESPAWNS, "-1", None)
            .unwrap();
        assert!(node.may_respawn());
    }

    #[test]
    fn respawn_requires_dead_state_and_flag() {
        let mut node = Container::new(ContainerId(3), "a".into(), Cred::root(), None);
        node.props
            .set_from_string(names::RESPAWN, "true", None)
            .unwrap();
        assert!(!node.may_respawn());
        node.state = ContainerState::Dead;
        assert!(node.may_respawn());
        node.props
            .set_from_string(names::RESPAWN, "false", None)
            .unwrap();
        assert!(!node.may_respawn());
    }

    #[test]
    fn sleep_while_returns_when_condition_clears() {
        let mut calls = 0;
        let cleared = sleep_while(Duration::from_secs(5), || {
            calls += 1;
            calls < 3
        });
        assert!(cleared);
        assert_eq!(calls, 3);
    }

    #[test]
    fn sleep_while_times_out() {
        let cleared = sleep_while(Duration::from_millis(30), || true);
        assert!(!cleared);
    }

    fn tiny_tree() -> ContainerSet {
        let mut set = ContainerSet::new();
        set.insert(Container::new(
            ContainerId::ROOT,
            ROOT_CONTAINER.into(),
            Cred::root(),
            None,
        ));
        set.insert(Container::new(
            ContainerId::WARDEN_ROOT,
            WARDEN_ROOT_CONTAINER.into(),
            Cred::root(),
            Some(ContainerId::ROOT),
        ));
        set.insert(Container::new(
            ContainerId(3),
            "a".into(),
            Cred::root(),
            Some(ContainerId::WARDEN_ROOT),
        ));
        set.insert(Container::new(
            ContainerId(4),
            "a/b".into(),
            Cred::root(),
            Some(ContainerId(3)),
        ));
        set
    }

    #[test]
    fn ancestors_walk_to_the_root() {
        let set = tiny_tree();
        assert_eq!(
            set.ancestors(ContainerId(4)),
            vec![ContainerId(3), ContainerId::WARDEN_ROOT, ContainerId::ROOT]
        );
        assert!(set.ancestors(ContainerId::ROOT).is_empty());
    }

    #[test]
    fn subtree_is_breadth_first() {
        let set = tiny_tree();
        assert_eq!(
            set.subtree(ContainerId(3)),
            vec![ContainerId(3), ContainerId(4)]
        );
        assert_eq!(
            set.subtree(ContainerId::ROOT),
            vec![
                ContainerId::ROOT,
                ContainerId::WARDEN_ROOT,
                ContainerId(3),
                ContainerId(4)
            ]
        );
    }

    #[test]
    fn hierarchical_validation_bounds_both_directions() {
        let mut set = tiny_tree();
        set.node_mut(ContainerId(3))
            .unwrap()
            .props
            .set_from_string(names::MEMORY_LIMIT, "100M", None)
            .unwrap();

        // Child may not exceed the parent's cap.
        let err = set
            .validate_hierarchical(ContainerId(4), names::MEMORY_LIMIT, 200 << 20)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-value");
        set.validate_hierarchical(ContainerId(4), names::MEMORY_LIMIT, 50 << 20)
            .unwrap();

        // Parent may not drop below the children's total.
        set.node_mut(ContainerId(4))
            .unwrap()
            .props
            .set_from_string(names::MEMORY_LIMIT, "80M", None)
            .unwrap();
        let err = set
            .validate_hierarchical(ContainerId(3), names::MEMORY_LIMIT, 50 << 20)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-value");

        // Unset (zero) always passes.
        set.validate_hierarchical(ContainerId(3), names::MEMORY_LIMIT, 0)
            .unwrap();
    }

    #[test]
    fn children_sum_recurses_through_unset_nodes() {
        let mut set = tiny_tree();
        set.insert(Container::new(
            ContainerId(5),
            "a/b/c".into(),
            Cred::root(),
            Some(ContainerId(4)),
        ));
        // b unset, c set: a's children-sum sees through b.
        set.node_mut(ContainerId(5))
            .unwrap()
            .props
            .set_from_string(names::MEMORY_LIMIT, "10M", None)
            .unwrap();
        assert_eq!(
            set.children_sum(ContainerId(3), names::MEMORY_LIMIT, None),
            10 << 20
        );
    }
}
