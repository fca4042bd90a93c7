//! The container holder: global name index, id allocation, the reserved
//! roots, restore orchestration, and event dispatch.
//!
//! Every client-visible operation enters through here; the holder owns
//! the arena, the runtime context, and the timer queue, and returns the
//! side effects (waiter notifications, exit acknowledgements) for the
//! event loop to carry out.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use warden_common::constants::{
    CONTAINER_DEPTH_MAX, CONTAINER_ID_MAX, DOT_CONTAINER, ROOT_CONTAINER,
    STDIO_READ_BYTES, WARDEN_ROOT_CONTAINER,
};
use warden_common::error::{Result, WardenError};
use warden_common::types::{self, ContainerId, ContainerState, Cred};
use warden_core::cgroup::memory;
use warden_core::task::{self, RestoredTask};

use crate::container::{Actions, Container, ContainerSet};
use crate::context::RuntimeContext;
use crate::event::{Event, EventQueue};
use crate::property::{self, data, flags, names, PropertyMap, Value};

/// Bitmap id allocator with lowest-free policy.
#[derive(Debug, Default)]
struct IdAllocator {
    words: Vec<u64>,
}

impl IdAllocator {
    fn mark_used(&mut self, id: u32) {
        let (word, bit) = ((id / 64) as usize, id % 64);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    fn release(&mut self, id: u32) {
        let (word, bit) = ((id / 64) as usize, id % 64);
        if let Some(slot) = self.words.get_mut(word) {
            *slot &= !(1 << bit);
        }
    }

    fn acquire(&mut self) -> Result<u32> {
        // Id 0 is never valid; 1 and 2 are marked at holder start.
        for id in 1..=CONTAINER_ID_MAX {
            let (word, bit) = ((id / 64) as usize, id % 64);
            if self.words.get(word).copied().unwrap_or(0) & (1 << bit) == 0 {
                self.mark_used(id);
                return Ok(id);
            }
        }
        Err(WardenError::InvalidValue("container id space exhausted".into()))
    }
}

/// Matches `*` (any run) and `?` (one char) glob patterns.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();
    // Classic two-pointer matcher with single backtrack point.
    let (mut p, mut t) = (0_usize, 0_usize);
    let (mut star, mut mark) = (usize::MAX, 0_usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = p;
            mark = t;
            p += 1;
        } else if star != usize::MAX {
            p = star + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// The holder.
pub struct Holder {
    /// Runtime context threaded into every container operation.
    pub ctx: RuntimeContext,
    set: ContainerSet,
    name_index: HashMap<String, ContainerId>,
    ids: IdAllocator,
    queue: EventQueue,
}

impl Holder {
    /// Creates the holder with the two reserved roots in *meta* state and
    /// schedules the first log-rotation sweep.
    ///
    /// # Errors
    ///
    /// Returns an error when the warden-root cgroups cannot be created
    /// on a host with mounted controllers.
    pub fn new(ctx: RuntimeContext) -> Result<Self> {
        let mut holder = Self {
            ctx,
            set: ContainerSet::new(),
            name_index: HashMap::new(),
            ids: IdAllocator::default(),
            queue: EventQueue::new(),
        };
        holder.ids.mark_used(ContainerId::ROOT.0);
        holder.ids.mark_used(ContainerId::WARDEN_ROOT.0);

        let mut root = Container::new(
            ContainerId::ROOT,
            ROOT_CONTAINER.to_string(),
            Cred::root(),
            None,
        );
        root.state = ContainerState::Meta;
        holder.index(root.id(), ROOT_CONTAINER);
        holder.set.insert(root);

        let mut warden_root = Container::new(
            ContainerId::WARDEN_ROOT,
            WARDEN_ROOT_CONTAINER.to_string(),
            Cred::root(),
            Some(ContainerId::ROOT),
        );
        warden_root.state = ContainerState::Meta;
        for subsystem in holder.ctx.subsystems.supported() {
            warden_root.leaf_cgroup(subsystem).create()?;
        }
        holder.index(warden_root.id(), WARDEN_ROOT_CONTAINER);
        holder.set.insert(warden_root);

        holder.queue.add(
            Duration::from_millis(holder.ctx.config.container.rotate_interval_ms),
            Event::RotateLogs,
        );
        Ok(holder)
    }

    fn index(&mut self, id: ContainerId, name: &str) {
        self.name_index.insert(name.to_string(), id);
    }

    /// Resolves a full container name.
    ///
    /// # Errors
    ///
    /// Returns `container-does-not-exist` for unknown names.
    pub fn resolve(&self, name: &str) -> Result<ContainerId> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| WardenError::ContainerDoesNotExist(name.to_string()))
    }

    /// Immutable access by name.
    ///
    /// # Errors
    ///
    /// Returns `container-does-not-exist` for unknown names.
    pub fn get(&self, name: &str) -> Result<&Container> {
        self.set.node(self.resolve(name)?)
    }

    /// Number of live containers, the two roots included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Always false; the roots exist from construction on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// All container names except the reserved roots, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .set
            .iter()
            .filter(|c| !c.is_reserved())
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Creates a container in the *stopped* state.
    ///
    /// # Errors
    ///
    /// `invalid-value` for a bad name, `container-already-exists`,
    /// `container-does-not-exist` for a missing parent.
    pub fn create(&mut self, name: &str, owner: Cred) -> Result<ContainerId> {
        types::validate_name(name)?;
        if name == ROOT_CONTAINER || name == WARDEN_ROOT_CONTAINER {
            return Err(WardenError::ContainerAlreadyExists(name.to_string()));
        }
        if self.name_index.contains_key(name) {
            return Err(WardenError::ContainerAlreadyExists(name.to_string()));
        }
        if name.split('/').count() > CONTAINER_DEPTH_MAX {
            return Err(WardenError::InvalidValue(format!(
                "container tree deeper than {CONTAINER_DEPTH_MAX}"
            )));
        }

        let parent_id = match types::parent_name(name) {
            Some(parent) => self.resolve(parent).map_err(|_| {
                WardenError::ContainerDoesNotExist(format!("parent of {name}"))
            })?,
            None => ContainerId::WARDEN_ROOT,
        };

        let id = ContainerId(self.ids.acquire()?);
        tracing::info!(container = name, id = %id, owner = %owner, "create");

        let mut container = Container::new(id, name.to_string(), owner, Some(parent_id));
        let node = self.ctx.kv.node(id);
        container
            .props
            .set_value(names::RAW_NAME, Value::Str(name.to_string()), Some(&node))?;
        container
            .props
            .set_value(names::RAW_ID, Value::Uint(u64::from(id.0)), Some(&node))?;
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(owner.uid))
            .ok()
            .flatten()
            .map_or_else(|| owner.uid.to_string(), |u| u.name);
        let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(owner.gid))
            .ok()
            .flatten()
            .map_or_else(|| owner.gid.to_string(), |g| g.name);
        container
            .props
            .set_value(names::USER, Value::Str(user), Some(&node))?;
        container
            .props
            .set_value(names::GROUP, Value::Str(group), Some(&node))?;
        // The persisted state marks the create as complete for restore.
        node.set(data::STATE, &ContainerState::Stopped.to_string())?;

        self.index(id, name);
        self.set.insert(container);
        Ok(id)
    }

    /// Marks a lost-and-restored container dead once its cgroup is empty.
    fn sync_state(&mut self, id: ContainerId, actions: &mut Actions) {
        let Ok(node) = self.set.node(id) else { return };
        if node.lost_and_restored
            && node.state() == ContainerState::Running
            && node.processes(&self.ctx).is_empty()
        {
            tracing::info!(container = %node.name(), "lost container is empty, marking dead");
            self.set.exit(&mut self.ctx, &mut self.queue, id, -1, false, actions);
        }
    }

    /// Starts a container.
    ///
    /// # Errors
    ///
    /// Permission and state errors, then anything out of resource
    /// preparation or the launch protocol.
    pub fn start(&mut self, name: &str, caller: Cred) -> Result<Actions> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        if self.set.node(id)?.is_reserved() {
            return Err(WardenError::InvalidState(format!(
                "cannot start {name}"
            )));
        }
        let mut actions = Actions::default();
        self.sync_state(id, &mut actions);
        self.set.start(&mut self.ctx, id, &mut actions)?;
        Ok(actions)
    }

    /// Stops a container and its subtree.
    ///
    /// # Errors
    ///
    /// Permission, state, and kill-protocol errors.
    pub fn stop(&mut self, name: &str, caller: Cred) -> Result<Actions> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        if self.set.node(id)?.is_reserved() {
            return Err(WardenError::InvalidState(format!("cannot stop {name}")));
        }
        let mut actions = Actions::default();
        self.sync_state(id, &mut actions);
        self.set.stop(&mut self.ctx, id, &mut actions)?;
        Ok(actions)
    }

    /// Pauses a running container.
    ///
    /// # Errors
    ///
    /// Permission, state, and freezer errors.
    pub fn pause(&mut self, name: &str, caller: Cred) -> Result<Actions> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        let mut actions = Actions::default();
        self.set.pause(&self.ctx, id, &mut actions)?;
        Ok(actions)
    }

    /// Resumes a paused container.
    ///
    /// # Errors
    ///
    /// Permission, state (including paused ancestors), freezer errors.
    pub fn resume(&mut self, name: &str, caller: Cred) -> Result<Actions> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        let mut actions = Actions::default();
        self.set.resume(&self.ctx, id, &mut actions)?;
        Ok(actions)
    }

    /// Signals a running container's primary task.
    ///
    /// # Errors
    ///
    /// Permission and state errors, or the kill errno.
    pub fn kill(&mut self, name: &str, signal: Signal, caller: Cred) -> Result<()> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        self.set.kill(id, signal)
    }

    /// Destroys a container and its subtree.
    ///
    /// # Errors
    ///
    /// Permission errors, `invalid-state` for the roots, stop failures.
    pub fn destroy(&mut self, name: &str, caller: Cred) -> Result<Actions> {
        let id = self.resolve(name)?;
        self.set.node(id)?.check_permission(caller)?;
        if self.set.node(id)?.is_reserved() {
            return Err(WardenError::Permission(format!(
                "cannot destroy {name}"
            )));
        }
        let mut actions = Actions::default();
        self.sync_state(id, &mut actions);
        let removed = self.set.destroy(&mut self.ctx, id, &mut actions)?;
        for gone in removed {
            self.ids.release(gone.0);
            self.name_index.retain(|_, &mut v| v != gone);
        }
        Ok(actions)
    }

    /// Sets a property through the full client-path checks.
    ///
    /// # Errors
    ///
    /// The full §7 taxonomy: unknown names, permission, state gates,
    /// hierarchy violations, kv failures.
    pub fn set_property(
        &mut self,
        name: &str,
        raw_property: &str,
        raw_value: &str,
        caller: Cred,
    ) -> Result<()> {
        let id = self.resolve(name)?;
        {
            let node = self.set.node(id)?;
            if node.is_reserved() {
                return Err(WardenError::InvalidValue(format!(
                    "cannot set properties of {name}"
                )));
            }
            node.check_permission(caller)?;
        }
        let mut actions = Actions::default();
        self.sync_state(id, &mut actions);

        let (aliased, value) = property::resolve_alias(raw_property, raw_value.trim());
        let (prop, idx) = property::split_index(aliased)?;
        let def = property::find(prop)?;
        if def.has_flag(flags::HIDDEN) {
            return Err(WardenError::InvalidProperty(prop.to_string()));
        }

        let node = self.set.node(id)?;
        if def.has_flag(flags::SUPERUSER) && !caller.is_privileged() {
            let current = node.props.get_string(prop);
            if current != value {
                return Err(WardenError::Permission(format!(
                    "only root may change {prop}"
                )));
            }
        }
        if !def.settable_in(node.state()) {
            return Err(WardenError::InvalidState(format!(
                "cannot set {prop} while {}",
                node.state()
            )));
        }
        if def.has_flag(flags::PARENT_RO) && !node.props.get_bool(names::ISOLATE) {
            return Err(WardenError::NotSupported(format!(
                "{prop} with isolate=false"
            )));
        }

        if property::HIERARCHICAL.contains(&prop) {
            let parsed = property::parse_size(&value)?;
            self.set.validate_hierarchical(id, prop, parsed)?;
        }

        let kv_node = self.ctx.kv.node(id);
        let node = self.set.node_mut(id)?;
        match idx {
            Some(index) => node.props.set_indexed(prop, index, &value, Some(&kv_node))?,
            None => node.props.set_from_string(prop, &value, Some(&kv_node))?,
        }

        if def.has_flag(flags::DYNAMIC)
            && matches!(
                node.state(),
                ContainerState::Running | ContainerState::Meta
            )
        {
            let node = self.set.node(id)?;
            node.apply_dynamic_properties(&self.ctx)?;
        }
        Ok(())
    }

    /// Reads a property in its client string form.
    ///
    /// # Errors
    ///
    /// Unknown names and index errors from the §7 taxonomy.
    pub fn get_property(&self, name: &str, raw_property: &str) -> Result<String> {
        let node = self.get(name)?;
        if node.is_reserved() {
            return Err(WardenError::InvalidProperty(format!(
                "no properties on {name}"
            )));
        }

        let (aliased, _) = property::resolve_alias(raw_property, "");
        let (prop, idx) = property::split_index(aliased)?;
        let def = property::find(prop)?;
        if def.has_flag(flags::HIDDEN) {
            return Err(WardenError::InvalidProperty(prop.to_string()));
        }

        let value = node.props.get(prop)?;
        let rendered = match idx {
            Some(index) => match &value {
                Value::UintMap(map) => map
                    .get(index)
                    .map(u64::to_string)
                    .ok_or_else(|| {
                        WardenError::InvalidValue(format!("invalid index {index}"))
                    })?,
                _ => {
                    return Err(WardenError::InvalidValue(format!(
                        "property {prop} does not take an index"
                    )))
                }
            },
            None => value.to_string(),
        };

        if property::is_alias(raw_property) {
            Ok(property::alias_display(raw_property, &rendered))
        } else {
            Ok(rendered)
        }
    }

    /// Reads a data value.
    ///
    /// # Errors
    ///
    /// `invalid-data` for unknown names.
    pub fn get_data(&mut self, name: &str, data_name: &str) -> Result<String> {
        let id = self.resolve(name)?;
        let mut actions = Actions::default();
        self.sync_state(id, &mut actions);
        let node = self.set.node(id)?;

        match data_name {
            data::STDOUT => {
                let path = node.stdout_path(&self.ctx);
                Ok(task::read_tail(&path, STDIO_READ_BYTES)?)
            }
            data::STDERR => {
                let path = node.stderr_path(&self.ctx);
                Ok(task::read_tail(&path, STDIO_READ_BYTES)?)
            }
            data::MEMORY_USAGE => {
                if !self.ctx.subsystems.memory.supported() {
                    return Err(WardenError::NotSupported(data_name.to_string()));
                }
                let cg = node.leaf_cgroup(&self.ctx.subsystems.memory);
                Ok(memory::usage(&cg)?.to_string())
            }
            data::CPU_USAGE => {
                if !self.ctx.subsystems.cpuacct.supported() {
                    return Err(WardenError::NotSupported(data_name.to_string()));
                }
                let cg = node.leaf_cgroup(&self.ctx.subsystems.cpuacct);
                Ok(cg.get_knob_u64("cpuacct.usage")?.to_string())
            }
            data::PARENT => Ok(node
                .parent()
                .and_then(|p| self.set.node(p).ok())
                .map(|p| p.name().to_string())
                .unwrap_or_default()),
            data::CHILDREN => {
                let names: Vec<String> = node
                    .children()
                    .iter()
                    .filter_map(|&c| self.set.node(c).ok())
                    .map(|c| c.name().to_string())
                    .collect();
                Ok(names.join("; "))
            }
            other => Ok(node.stored_data(other)?.to_string()),
        }
    }

    /// Registers a state-change waiter for every container matching the
    /// glob; a matching container that is not *running* answers at once.
    #[must_use]
    pub fn wait(&mut self, glob: &str, token: u64) -> Actions {
        let mut actions = Actions::default();
        let matching: Vec<ContainerId> = self
            .set
            .iter()
            .filter(|c| !c.is_reserved() && glob_match(glob, c.name()))
            .map(Container::id)
            .collect();
        if matching.is_empty() {
            actions.notified.push(crate::container::Notification {
                token,
                name: String::new(),
                state: ContainerState::Stopped,
            });
            return actions;
        }
        for id in matching {
            self.set.add_waiter(id, token, &mut actions);
            if !actions.notified.is_empty() {
                break;
            }
        }
        actions
    }

    /// Raw OOM eventfds to include in the poll set, with their owners.
    #[must_use]
    pub fn oom_sources(&self) -> Vec<(RawFd, ContainerId)> {
        self.set
            .iter()
            .filter_map(|c| c.oom_fd().map(|fd| (fd, c.id())))
            .collect()
    }

    /// Time until the next scheduled event.
    #[must_use]
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.queue.next_timeout(now)
    }

    /// Delivers every expired timer event.
    #[must_use]
    pub fn process_expired(&mut self, now: Instant) -> Actions {
        let mut actions = Actions::default();
        for event in self.queue.take_expired(now) {
            self.dispatch(event, &mut actions);
        }
        actions
    }

    /// Delivers one event into the tree.
    #[must_use]
    pub fn deliver_event(&mut self, event: Event) -> Actions {
        let mut actions = Actions::default();
        self.dispatch(event, &mut actions);
        actions
    }

    fn dispatch(&mut self, event: Event, actions: &mut Actions) {
        match event {
            Event::Exit { pid, status } => self.deliver_exit(pid, status, actions),
            Event::Oom { fd } => self.deliver_oom(fd, actions),
            Event::Respawn(id) => {
                if self.set.node(id).map(Container::may_respawn).unwrap_or(false) {
                    if let Err(e) = self.set.respawn(&mut self.ctx, id, actions) {
                        tracing::error!(id = %id, error = %e, "respawn failed");
                    }
                }
            }
            Event::RotateLogs => self.rotate_tick(actions),
        }
    }

    fn deliver_exit(&mut self, pid: i32, status: i32, actions: &mut Actions) {
        let target = self
            .set
            .iter()
            .find(|c| c.root_pid() == Some(Pid::from_raw(pid)))
            .map(Container::id);
        let Some(id) = target else {
            // Not ours (or already handled); keep the master's map clean.
            actions.ack_pids.push(pid);
            return;
        };
        if self.set.node(id).map(Container::state).ok() == Some(ContainerState::Dead) {
            actions.ack_pids.push(pid);
            return;
        }
        let oom = self
            .set
            .node(id)
            .map(Container::oom_fd_triggered)
            .unwrap_or(false);
        self.set
            .exit(&mut self.ctx, &mut self.queue, id, status, oom, actions);
    }

    fn deliver_oom(&mut self, fd: RawFd, actions: &mut Actions) {
        let target = self
            .set
            .iter()
            .find(|c| c.oom_fd() == Some(fd))
            .map(Container::id);
        let Some(id) = target else { return };
        if let Some(oom_fd) = self.set.node(id).ok().and_then(|c| c.oom_fd.as_ref()) {
            memory::drain_oom_fd(oom_fd);
        }
        if self.set.node(id).map(Container::state).ok() == Some(ContainerState::Dead) {
            return;
        }
        // The effective delivered signal is recorded as SIGKILL.
        let status = Signal::SIGKILL as i32;
        self.set
            .exit(&mut self.ctx, &mut self.queue, id, status, true, actions);
    }

    /// Periodic sweep: rotate oversized stdio files and stop aged-out
    /// dead containers; reschedules itself.
    fn rotate_tick(&mut self, actions: &mut Actions) {
        let max = self.ctx.config.container.max_log_size;
        let running: Vec<ContainerId> = self
            .set
            .iter()
            .filter(|c| c.state() == ContainerState::Running)
            .map(Container::id)
            .collect();
        for id in running {
            if let Ok(node) = self.set.node(id) {
                for path in [node.stdout_path(&self.ctx), node.stderr_path(&self.ctx)] {
                    if let Err(e) = task::rotate_file(&path, max) {
                        tracing::warn!(error = %e, "log rotation failed");
                    }
                }
            }
        }

        let aged: Vec<ContainerId> = self
            .set
            .iter()
            .filter(|c| c.aged_out())
            .map(Container::id)
            .collect();
        for id in aged {
            tracing::info!(id = %id, "dead container aged out");
            if let Err(e) = self.set.stop(&mut self.ctx, id, actions) {
                tracing::warn!(id = %id, error = %e, "aging stop failed");
            }
        }

        self.queue.add(
            Duration::from_millis(self.ctx.config.container.rotate_interval_ms),
            Event::RotateLogs,
        );
    }

    /// The accumulated namespace prefix of a container, its own
    /// `warden_namespace` property included.
    #[must_use]
    pub fn namespace_of(&self, id: ContainerId) -> String {
        let mut prefix = String::new();
        let mut chain = self.set.ancestors(id);
        chain.reverse();
        chain.push(id);
        for link in chain {
            if let Ok(node) = self.set.node(link) {
                prefix.push_str(&node.props.get_string(names::WARDEN_NAMESPACE));
            }
        }
        prefix
    }

    /// Finds the container a client pid runs in, through its freezer
    /// cgroup; pids outside any container map to the warden root.
    #[must_use]
    pub fn container_of_pid(&self, pid: i32) -> ContainerId {
        let Ok(cgroups) = std::fs::read_to_string(format!("/proc/{pid}/cgroup")) else {
            return ContainerId::WARDEN_ROOT;
        };
        for line in cgroups.lines() {
            let mut fields = line.splitn(3, ':');
            let _ = fields.next();
            let controllers = fields.next().unwrap_or("");
            let path = fields.next().unwrap_or("").trim_start_matches('/');
            if controllers.split(',').any(|c| c == "freezer") {
                if let Some(name) = path.strip_prefix("warden/") {
                    if let Ok(id) = self.resolve(name) {
                        return id;
                    }
                }
            }
        }
        ContainerId::WARDEN_ROOT
    }

    /// Translates a client-relative name to an absolute one.
    ///
    /// # Errors
    ///
    /// Returns `permission` for the read-only meta names when
    /// `resolve_meta` is false.
    pub fn absolute_name(
        &self,
        client: ContainerId,
        relative: &str,
        resolve_meta: bool,
    ) -> Result<String> {
        if relative == ROOT_CONTAINER
            || relative == WARDEN_ROOT_CONTAINER
            || relative == DOT_CONTAINER
        {
            if !resolve_meta {
                return Err(WardenError::Permission(
                    "meta containers are read-only".into(),
                ));
            }
            if relative == DOT_CONTAINER {
                let ns = self.namespace_of(client);
                let trimmed = ns.trim_end_matches('/');
                return Ok(match trimmed.rfind('/') {
                    Some(cut) => trimmed[..cut].to_string(),
                    None => WARDEN_ROOT_CONTAINER.to_string(),
                });
            }
            return Ok(relative.to_string());
        }
        Ok(format!("{}{relative}", self.namespace_of(client)))
    }

    /// Translates an absolute name into the client's namespace.
    ///
    /// # Errors
    ///
    /// Returns `container-does-not-exist` when the name is outside the
    /// client's namespace.
    pub fn relative_name(&self, client: ContainerId, absolute: &str) -> Result<String> {
        let ns = self.namespace_of(client);
        if ns.is_empty() {
            return Ok(absolute.to_string());
        }
        absolute.strip_prefix(&ns).map(str::to_string).ok_or_else(|| {
            WardenError::ContainerDoesNotExist(format!(
                "{absolute} is outside the caller's namespace"
            ))
        })
    }

    /// Restores the container set from the kv store after daemon restart.
    ///
    /// Containers are rebuilt parents-first; failures are logged and the
    /// remaining nodes still restored.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself cannot be read.
    pub fn restore_all(&mut self) -> Result<usize> {
        let mut nodes = self.ctx.kv.restore_all()?;
        // Parents sort before children at equal prefixes.
        nodes.sort_by(|(_, a), (_, b)| {
            let name_a = a.get(names::RAW_NAME).cloned().unwrap_or_default();
            let name_b = b.get(names::RAW_NAME).cloned().unwrap_or_default();
            (name_a.matches('/').count(), name_a).cmp(&(name_b.matches('/').count(), name_b))
        });

        let mut restored = 0;
        for (id, pairs) in nodes {
            if id.is_reserved() {
                continue;
            }
            match self.restore_one(id, &pairs) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(id = %id, error = %e, "restore failed, dropping node");
                    let _ = self.ctx.kv.node(id).remove();
                }
            }
        }
        tracing::info!(restored, "container restore complete");
        Ok(restored)
    }

    fn restore_one(
        &mut self,
        id: ContainerId,
        pairs: &std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let name = pairs
            .get(names::RAW_NAME)
            .cloned()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| WardenError::InvalidValue("node without a name".into()))?;
        // A node without a persisted state never completed its create.
        let recorded_state = pairs
            .get(data::STATE)
            .ok_or_else(|| WardenError::InvalidValue("create never completed".into()))?;
        let recorded_state = ContainerState::parse(recorded_state)?;

        let parent_id = match types::parent_name(&name) {
            Some(parent) => self.resolve(parent)?,
            None => ContainerId::WARDEN_ROOT,
        };

        tracing::info!(container = %name, id = %id, "restore");
        self.ids.mark_used(id.0);

        let mut props = PropertyMap::new();
        props.restore(pairs);

        let owner_name = props.get_string(names::USER);
        let owner = nix::unistd::User::from_name(&owner_name)
            .ok()
            .flatten()
            .map_or_else(Cred::root, |u| Cred::new(u.uid.as_raw(), u.gid.as_raw()));

        let mut container = Container::new(id, name.clone(), owner, Some(parent_id));
        container.props = props;
        container.props.sync(&self.ctx.kv.node(id))?;
        container.respawn_count = pairs
            .get(data::RESPAWN_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        container.exit_status = pairs.get(data::EXIT_STATUS).and_then(|v| v.parse().ok());
        container.oom_killed = pairs.get(data::OOM_KILLED).map(String::as_str) == Some("true");

        let raw_pid = container
            .props
            .get(names::RAW_ROOT_PID)
            .ok()
            .and_then(|v| match v {
                Value::Int(pid) => Some(pid),
                _ => None,
            })
            .unwrap_or(0);
        let started = raw_pid > 0;

        self.index(id, &name);
        self.set.insert(container);
        let mut actions = Actions::default();

        if started {
            let parent_tc = self
                .set
                .node(parent_id)
                .ok()
                .and_then(|p| p.traffic_class.clone());
            {
                let node = self.set.node_mut(id)?;
                if let Err(e) = node.prepare_resources(&mut self.ctx, parent_tc.as_ref()) {
                    tracing::warn!(container = %name, error = %e, "resource restore incomplete");
                }
            }

            let expected = self.set.node(id)?.cgroup_rel();
            let mut probe = warden_core::task::Task::new();
            let classification =
                probe.restore(Pid::from_raw(i32::try_from(raw_pid).unwrap_or(0)), &expected);

            match classification {
                RestoredTask::Running | RestoredTask::Zombie => {
                    self.set.node_mut(id)?.root_pid = probe.pid();
                    if recorded_state == ContainerState::Dead {
                        self.set
                            .set_state(&self.ctx, id, ContainerState::Dead, &mut actions);
                        self.set.node_mut(id)?.death_time = Some(Instant::now());
                    } else {
                        self.set
                            .set_state(&self.ctx, id, ContainerState::Running, &mut actions);
                        let frozen = self.ctx.subsystems.freezer.supported()
                            && warden_core::cgroup::freezer::is_frozen(
                                &self.set.node(id)?.leaf_cgroup(&self.ctx.subsystems.freezer),
                            );
                        if frozen {
                            self.set
                                .set_state(&self.ctx, id, ContainerState::Paused, &mut actions);
                        }
                    }
                }
                RestoredTask::Lost | RestoredTask::Dead => {
                    tracing::warn!(container = %name, "task lost across restart");
                    if recorded_state == ContainerState::Dead {
                        self.set
                            .set_state(&self.ctx, id, ContainerState::Dead, &mut actions);
                    } else {
                        self.set
                            .set_state(&self.ctx, id, ContainerState::Running, &mut actions);
                        self.set.node_mut(id)?.lost_and_restored = true;
                        self.sync_state(id, &mut actions);
                    }
                    self.set.node_mut(id)?.death_time = Some(Instant::now());
                }
            }

        } else {
            // No live task to re-attach; either the container never
            // started, or it died and its pid was already cleared. Make
            // sure nothing is left running from a racing start.
            if self.ctx.subsystems.freezer.supported() {
                let node = self.set.node(id)?;
                if node.leaf_cgroup(&self.ctx.subsystems.freezer).exists() {
                    let _ = node.kill_all(&self.ctx);
                }
            }
            if recorded_state == ContainerState::Dead {
                self.set
                    .set_state(&self.ctx, id, ContainerState::Dead, &mut actions);
                self.set.node_mut(id)?.death_time = Some(Instant::now());
            } else {
                self.set
                    .set_state(&self.ctx, id, ContainerState::Stopped, &mut actions);
            }
        }

        if self.set.node(id)?.may_respawn() {
            self.queue.add(
                Duration::from_millis(self.ctx.config.container.respawn_delay_ms),
                Event::Respawn(id),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "a/b"));
        assert!(glob_match("a/*", "a/b"));
        assert!(glob_match("a/*", "a/b/c"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("web-*", "web-1"));
        assert!(!glob_match("web-*", "db-1"));
        assert!(glob_match("a", "a"));
        assert!(!glob_match("a", "b"));
    }

    #[test]
    fn id_allocator_hands_out_lowest_free() {
        let mut ids = IdAllocator::default();
        ids.mark_used(1);
        ids.mark_used(2);
        assert_eq!(ids.acquire().unwrap(), 3);
        assert_eq!(ids.acquire().unwrap(), 4);
        ids.release(3);
        assert_eq!(ids.acquire().unwrap(), 3);
        assert_eq!(ids.acquire().unwrap(), 5);
    }

    #[test]
    fn id_allocator_survives_sparse_marks() {
        let mut ids = IdAllocator::default();
        ids.mark_used(1);
        ids.mark_used(200);
        assert_eq!(ids.acquire().unwrap(), 2);
        ids.release(1);
        assert_eq!(ids.acquire().unwrap(), 1);
    }
}
