//! End-to-end lifecycle tests against the holder.
//!
//! These run without root: controllers probe unsupported under a scratch
//! directory, so cgroup side effects are skipped, and a fake launcher
//! hands out pids far above `pid_max` instead of forking.

use std::cell::Cell;
use std::path::Path;
use std::time::{Duration, Instant};

use warden_common::config::WardenConfig;
use warden_common::error::Result;
use warden_common::types::{ContainerState, Cred};
use warden_core::loopdev::LoopPool;
use warden_core::task::TaskEnv;
use warden_runtime::context::{Launcher, RuntimeContext, Stats, Subsystems};
use warden_runtime::event::Event;
use warden_runtime::holder::Holder;
use warden_runtime::kv::KvStore;

struct FakeLauncher {
    next_pid: Cell<i32>,
}

impl FakeLauncher {
    fn new() -> Self {
        // Far above any real pid_max so stray signals always miss.
        Self {
            next_pid: Cell::new(500_000_000),
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, _env: &mut TaskEnv) -> Result<nix::unistd::Pid> {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        Ok(nix::unistd::Pid::from_raw(pid))
    }
}

fn test_context(base: &Path) -> RuntimeContext {
    let mut config = WardenConfig::default();
    config.container.tmp_dir = base.join("tmp");
    config.container.kill_timeout_ms = 50;
    config.container.stop_timeout_ms = 100;
    config.container.respawn_delay_ms = 10;
    config.daemon.kv_root = base.join("kv");
    RuntimeContext {
        subsystems: Subsystems::probe(&base.join("cgroup")),
        loop_pool: LoopPool::new(),
        kv: KvStore::open(&config.daemon.kv_root).expect("kv store"),
        network_enabled: true,
        launcher: Box::new(FakeLauncher::new()),
        stats: Stats::default(),
        config,
    }
}

fn holder(base: &Path) -> Holder {
    Holder::new(test_context(base)).expect("holder")
}

const ROOT: Cred = Cred { uid: 0, gid: 0 };

fn state_of(holder: &Holder, name: &str) -> ContainerState {
    holder.get(name).expect("container").state()
}

#[test]
fn full_lifecycle_create_start_stop_destroy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());

    holder.create("a", ROOT).expect("create");
    assert_eq!(state_of(&holder, "a"), ContainerState::Stopped);

    holder
        .set_property("a", "command", "sleep 1000", ROOT)
        .expect("set command");
    holder.start("a", ROOT).expect("start");
    assert_eq!(state_of(&holder, "a"), ContainerState::Running);

    holder.stop("a", ROOT).expect("stop");
    assert_eq!(state_of(&holder, "a"), ContainerState::Stopped);

    holder.destroy("a", ROOT).expect("destroy");
    assert_eq!(
        holder.get("a").unwrap_err().kind(),
        "container-does-not-exist"
    );
}

#[test]
fn empty_command_starts_as_meta() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());

    holder.create("shell", ROOT).expect("create");
    holder.start("shell", ROOT).expect("start");
    assert_eq!(state_of(&holder, "shell"), ContainerState::Meta);
}

#[test]
fn start_requires_ready_parent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());

    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");
    holder
        .set_property("a/b", "command", "sleep 1", ROOT)
        .expect("set");

    // The parent is stopped, so the child may not run.
    let err = holder.start("a/b", ROOT).unwrap_err();
    assert_eq!(err.kind(), "invalid-state");

    holder.start("a", ROOT).expect("start parent");
    holder.start("a/b", ROOT).expect("start child");
    assert_eq!(state_of(&holder, "a/b"), ContainerState::Running);
}

#[test]
fn create_under_missing_parent_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    let err = holder.create("nope/child", ROOT).unwrap_err();
    assert_eq!(err.kind(), "container-does-not-exist");
}

#[test]
fn duplicate_create_is_already_exists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    let err = holder.create("a", ROOT).unwrap_err();
    assert_eq!(err.kind(), "container-already-exists");
}

#[test]
fn stop_when_stopped_is_invalid_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    let err = holder.stop("a", ROOT).unwrap_err();
    assert_eq!(err.kind(), "invalid-state");
}

#[test]
fn destroy_twice_is_container_does_not_exist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    holder.destroy("a", ROOT).expect("destroy");
    let err = holder.destroy("a", ROOT).unwrap_err();
    assert_eq!(err.kind(), "container-does-not-exist");
}

#[test]
fn destroy_removes_whole_subtree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");
    holder.create("a/b/c", ROOT).expect("create a/b/c");

    holder.destroy("a", ROOT).expect("destroy");
    for name in ["a", "a/b", "a/b/c"] {
        assert_eq!(
            holder.get(name).unwrap_err().kind(),
            "container-does-not-exist",
            "{name} should be gone"
        );
    }
    assert!(holder.list().is_empty());
}

#[test]
fn hierarchical_memory_limit_is_enforced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");

    holder
        .set_property("a", "memory_limit", "100M", ROOT)
        .expect("parent limit");
    let err = holder
        .set_property("a/b", "memory_limit", "200M", ROOT)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid-value");

    holder
        .set_property("a/b", "memory_limit", "50M", ROOT)
        .expect("within parent cap");
}

#[test]
fn pause_cascades_and_resume_on_child_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");
    for name in ["a", "a/b"] {
        holder
            .set_property(name, "command", "sleep 1000", ROOT)
            .expect("set");
    }
    holder.start("a", ROOT).expect("start a");
    holder.start("a/b", ROOT).expect("start a/b");

    holder.pause("a", ROOT).expect("pause");
    assert_eq!(state_of(&holder, "a"), ContainerState::Paused);
    assert_eq!(state_of(&holder, "a/b"), ContainerState::Paused);

    let err = holder.resume("a/b", ROOT).unwrap_err();
    assert_eq!(err.kind(), "invalid-state");

    holder.resume("a", ROOT).expect("resume");
    assert_eq!(state_of(&holder, "a"), ContainerState::Running);
    assert_eq!(state_of(&holder, "a/b"), ContainerState::Running);
}

#[test]
fn start_under_paused_ancestor_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");
    holder
        .set_property("a", "command", "sleep 1000", ROOT)
        .expect("set");
    holder
        .set_property("a/b", "command", "sleep 1000", ROOT)
        .expect("set");
    holder.start("a", ROOT).expect("start a");
    holder.pause("a", ROOT).expect("pause a");

    let err = holder.start("a/b", ROOT).unwrap_err();
    assert_eq!(err.kind(), "invalid-state");
}

#[test]
fn exit_event_marks_dead_and_acks_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    holder
        .set_property("a", "command", "sleep 1000", ROOT)
        .expect("set");
    holder.start("a", ROOT).expect("start");
    let pid: i32 = holder
        .get_data("a", "root_pid")
        .expect("root_pid")
        .parse()
        .expect("numeric pid");
    assert!(pid > 0);

    let actions = holder.deliver_event(Event::Exit { pid, status: 0 });
    assert_eq!(actions.ack_pids, vec![pid]);
    assert_eq!(state_of(&holder, "a"), ContainerState::Dead);
    assert_eq!(holder.get_data("a", "exit_status").unwrap(), "0");
}

#[test]
fn foreign_exit_event_is_acked_and_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    let actions = holder.deliver_event(Event::Exit {
        pid: 424_242,
        status: 0,
    });
    assert_eq!(actions.ack_pids, vec![424_242]);
}

#[test]
fn respawn_runs_until_budget_exhausted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    holder
        .set_property("a", "command", "/bin/true", ROOT)
        .expect("set command");
    holder
        .set_property("a", "respawn", "true", ROOT)
        .expect("set respawn");
    holder
        .set_property("a", "max_respawns", "2", ROOT)
        .expect("set budget");
    holder.start("a", ROOT).expect("start");

    for round in 0..3 {
        let pid: i32 = holder
            .get_data("a", "root_pid")
            .expect("root_pid")
            .parse()
            .expect("numeric pid");
        let _ = holder.deliver_event(Event::Exit { pid, status: 0 });
        assert_eq!(state_of(&holder, "a"), ContainerState::Dead, "round {round}");
        let _ = holder.process_expired(Instant::now() + Duration::from_secs(1));
    }

    // Two respawns happened, the third was refused.
    assert_eq!(holder.get_data("a", "respawn_count").unwrap(), "2");
    assert_eq!(state_of(&holder, "a"), ContainerState::Dead);
}

#[test]
fn name_index_stays_in_bijection_with_live_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());

    holder.create("a", ROOT).expect("create a");
    holder.create("b", ROOT).expect("create b");
    holder.create("a/c", ROOT).expect("create a/c");
    assert_eq!(holder.list(), vec!["a", "a/c", "b"]);

    holder.destroy("a", ROOT).expect("destroy a");
    assert_eq!(holder.list(), vec!["b"]);

    // Ids are reused lowest-first and names resolve again.
    holder.create("a", ROOT).expect("recreate a");
    assert_eq!(holder.list(), vec!["a", "b"]);
    assert!(holder.get("a").is_ok());
}

#[test]
fn waiter_fires_exactly_once_on_leaving_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    holder
        .set_property("a", "command", "sleep 1000", ROOT)
        .expect("set");
    holder.start("a", ROOT).expect("start");

    // Registration while running waits.
    let actions = holder.wait("a", 7);
    assert!(actions.notified.is_empty());

    let pid: i32 = holder
        .get_data("a", "root_pid")
        .unwrap()
        .parse()
        .expect("pid");
    let actions = holder.deliver_event(Event::Exit { pid, status: 0 });
    let tokens: Vec<u64> = actions.notified.iter().map(|n| n.token).collect();
    assert_eq!(tokens, vec![7]);
    assert_eq!(actions.notified[0].state, ContainerState::Dead);

    // Registration after the transition answers immediately.
    let actions = holder.wait("a", 8);
    assert_eq!(actions.notified.len(), 1);
    assert_eq!(actions.notified[0].token, 8);
}

#[test]
fn property_alias_roundtrip_through_holder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");

    holder
        .set_property("a", "memory.limit_in_bytes", "2M", ROOT)
        .expect("alias set");
    assert_eq!(holder.get_property("a", "memory_limit").unwrap(), "2097152");

    holder
        .set_property("a", "cpu.smart", "1", ROOT)
        .expect("alias set");
    assert_eq!(holder.get_property("a", "cpu_policy").unwrap(), "rt");
    assert_eq!(holder.get_property("a", "cpu.smart").unwrap(), "1");
}

#[test]
fn superuser_property_needs_privilege() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    let user = Cred::new(1000, 1000);
    holder.create("a", user).expect("create");

    let err = holder
        .set_property("a", "allowed_devices", "c 1:3 rwm", user)
        .unwrap_err();
    assert_eq!(err.kind(), "permission");

    holder
        .set_property("a", "allowed_devices", "c 1:3 rwm", ROOT)
        .expect("root may set");
}

#[test]
fn foreign_owner_cannot_operate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    let owner = Cred::new(1000, 1000);
    let other = Cred::new(1001, 1001);
    holder.create("a", owner).expect("create");
    holder
        .set_property("a", "command", "sleep 1", owner)
        .expect("owner sets");

    assert_eq!(holder.start("a", other).unwrap_err().kind(), "permission");
    assert_eq!(holder.destroy("a", other).unwrap_err().kind(), "permission");
    holder.start("a", owner).expect("owner starts");
}

#[test]
fn dynamic_property_refused_while_running_when_not_dynamic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create");
    holder
        .set_property("a", "command", "sleep 1000", ROOT)
        .expect("set");
    holder.start("a", ROOT).expect("start");

    // command is stopped-only; memory_limit is dynamic.
    let err = holder
        .set_property("a", "command", "sleep 2000", ROOT)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid-state");
    holder
        .set_property("a", "memory_limit", "64M", ROOT)
        .expect("dynamic set");
}

#[test]
fn persistent_properties_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut holder = holder(dir.path());
        holder.create("a", ROOT).expect("create");
        holder
            .set_property("a", "memory_limit", "2M", ROOT)
            .expect("set limit");
        holder
            .set_property("a", "command", "sleep 1000", ROOT)
            .expect("set command");
        holder.create("a/b", ROOT).expect("create child");
    }

    let mut restarted = holder(dir.path());
    let restored = restarted.restore_all().expect("restore");
    assert_eq!(restored, 2);

    assert_eq!(state_of(&restarted, "a"), ContainerState::Stopped);
    assert_eq!(state_of(&restarted, "a/b"), ContainerState::Stopped);
    assert_eq!(
        restarted.get_property("a", "memory_limit").unwrap(),
        "2097152"
    );
    assert_eq!(
        restarted.get_property("a", "command").unwrap(),
        "sleep 1000"
    );
}

#[test]
fn dead_container_restores_as_dead() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut holder = holder(dir.path());
        holder.create("a", ROOT).expect("create");
        holder
            .set_property("a", "command", "/bin/true", ROOT)
            .expect("set");
        holder.start("a", ROOT).expect("start");
        let pid: i32 = holder
            .get_data("a", "root_pid")
            .unwrap()
            .parse()
            .expect("pid");
        let _ = holder.deliver_event(Event::Exit { pid, status: 256 });
        assert_eq!(state_of(&holder, "a"), ContainerState::Dead);
    }

    let mut restarted = holder(dir.path());
    restarted.restore_all().expect("restore");
    assert_eq!(state_of(&restarted, "a"), ContainerState::Dead);
    assert_eq!(restarted.get_data("a", "exit_status").unwrap(), "256");
}

#[test]
fn running_container_with_lost_task_restores_as_dead() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut holder = holder(dir.path());
        holder.create("a", ROOT).expect("create");
        holder
            .set_property("a", "command", "sleep 1000", ROOT)
            .expect("set");
        holder.start("a", ROOT).expect("start");
        // The fake pid does not exist, mimicking a task that died while
        // the daemon was down.
    }

    let mut restarted = holder(dir.path());
    restarted.restore_all().expect("restore");
    assert_eq!(state_of(&restarted, "a"), ContainerState::Dead);
}

#[test]
fn destroyed_container_leaves_no_persistent_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut holder = holder(dir.path());
        holder.create("a", ROOT).expect("create");
        holder.create("keep", ROOT).expect("create keep");
        holder.destroy("a", ROOT).expect("destroy");
    }

    let mut restarted = holder(dir.path());
    let restored = restarted.restore_all().expect("restore");
    assert_eq!(restored, 1);
    assert_eq!(restarted.list(), vec!["keep"]);
}

#[test]
fn running_children_counter_tracks_descendants() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut holder = holder(dir.path());
    holder.create("a", ROOT).expect("create a");
    holder.create("a/b", ROOT).expect("create a/b");
    holder
        .set_property("a/b", "command", "sleep 1000", ROOT)
        .expect("set");
    holder.start("a", ROOT).expect("start a (meta)");
    holder.start("a/b", ROOT).expect("start a/b");

    assert_eq!(holder.get("a").unwrap().running_children(), 1);
    assert_eq!(holder.get("/warden").unwrap().running_children(), 1);

    holder.stop("a/b", ROOT).expect("stop child");
    assert_eq!(holder.get("a").unwrap().running_children(), 0);
    assert_eq!(holder.get("/warden").unwrap().running_children(), 0);
}
