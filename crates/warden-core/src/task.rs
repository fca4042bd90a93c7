//! Container task launch, restore, and teardown.
//!
//! The launch protocol detaches the child from the daemon's session and
//! places it in fresh mount, PID, and UTS namespaces:
//!
//! 1. the parent opens a close-on-exec status pipe,
//! 2. forks an intermediate that unshares the namespaces,
//! 3. the intermediate forks the real child (pid 1 of the new PID
//!    namespace), reports its pid through the pipe, and exits,
//! 4. the child sets itself up and execs; any failure writes an errno
//!    word to the pipe, while plain pipe closure signals a successful
//!    exec.

use std::ffi::CString;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Gid, Pid, Uid};

use warden_common::error::{Result, WardenError};

/// A bind mount applied inside the child's mount namespace.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host-side source path.
    pub source: PathBuf,
    /// Target path, relative to the container root.
    pub target: PathBuf,
    /// Remount read-only after binding.
    pub read_only: bool,
}

/// A resource limit installed before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    /// Which limit.
    pub resource: nix::sys::resource::Resource,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// Parses one `<name> <soft> <hard>` ulimit entry; `unlimited` maps to
/// the kernel's infinity value.
///
/// # Errors
///
/// Returns `invalid-value` for unknown names or malformed numbers.
pub fn parse_ulimit(entry: &str) -> Result<Ulimit> {
    use nix::sys::resource::Resource;

    let mut words = entry.split_whitespace();
    let (Some(name), Some(soft), Some(hard), None) =
        (words.next(), words.next(), words.next(), words.next())
    else {
        return Err(WardenError::InvalidValue(format!(
            "ulimit entry {entry:?} is not <name> <soft> <hard>"
        )));
    };

    let resource = match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "stack" => Resource::RLIMIT_STACK,
        other => {
            return Err(WardenError::InvalidValue(format!(
                "unknown ulimit {other:?}"
            )))
        }
    };

    let parse = |word: &str| -> Result<u64> {
        if word == "unlimited" {
            Ok(nix::sys::resource::RLIM_INFINITY)
        } else {
            word.parse().map_err(|_| {
                WardenError::InvalidValue(format!("bad ulimit value {word:?}"))
            })
        }
    };
    Ok(Ulimit {
        resource,
        soft: parse(soft)?,
        hard: parse(hard)?,
    })
}

/// Everything the launch protocol needs to start a container task.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    /// Command line, word-expanded before exec.
    pub command: String,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// Root to chroot into; empty means the host root.
    pub root: PathBuf,
    /// Remount the root read-only.
    pub root_read_only: bool,
    /// User to run as.
    pub user: String,
    /// Resolved uid.
    pub uid: u32,
    /// Resolved gid.
    pub gid: u32,
    /// Environment, one `KEY=value` per entry.
    pub environ: Vec<String>,
    /// Bind mounts applied before chroot.
    pub binds: Vec<BindMount>,
    /// Hostname set in the new UTS namespace, when non-empty.
    pub hostname: String,
    /// Stdout file path.
    pub stdout_path: PathBuf,
    /// Stderr file path.
    pub stderr_path: PathBuf,
    /// Resource limits installed before exec.
    pub ulimits: Vec<Ulimit>,
    /// Absolute paths of each leaf `cgroup.procs` file to join.
    pub cgroup_procs: Vec<PathBuf>,
}

impl TaskEnv {
    /// Resolves the user/group names and fills the standard environment.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` for an unknown user.
    pub fn prepare(&mut self, container_name: &str) -> Result<()> {
        let user = nix::unistd::User::from_name(&self.user)
            .map_err(|e| WardenError::errno("getpwnam", e))?
            .ok_or_else(|| {
                WardenError::InvalidValue(format!("unknown user {:?}", self.user))
            })?;
        self.uid = user.uid.as_raw();
        self.gid = user.gid.as_raw();

        if self.cwd.as_os_str().is_empty() {
            self.cwd = user.dir.clone();
        }

        let mut environ = vec![
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "container=warden".to_string(),
            format!("WARDEN_NAME={container_name}"),
            format!("HOME={}", self.cwd.display()),
            format!("USER={}", self.user),
        ];
        environ.append(&mut self.environ);
        self.environ = environ;
        Ok(())
    }
}

/// Splits a command line into exec words.
///
/// Single and double quotes group words; shell metacharacters outside
/// quotes are rejected so no command substitution or redirection can
/// sneak through exec.
///
/// # Errors
///
/// Returns `invalid-value` for unbalanced quotes or a metacharacter.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    const META: &str = "|&;<>(){}`$\n";
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None if META.contains(c) => {
                return Err(WardenError::InvalidValue(format!(
                    "unsupported shell construct {c:?} in command"
                )));
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(WardenError::InvalidValue(
            "unbalanced quote in command".into(),
        ));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(WardenError::InvalidValue("container command is empty".into()));
    }
    Ok(words)
}

/// Result of probing a remembered pid during restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoredTask {
    /// The pid is gone.
    Dead,
    /// The pid is a zombie awaiting reaping.
    Zombie,
    /// The pid is alive and inside the expected freezer cgroup.
    Running,
    /// The pid is alive but its cgroup context is no longer trustworthy.
    Lost,
}

/// The container's primary process.
#[derive(Debug)]
pub struct Task {
    pid: Option<Pid>,
}

impl Task {
    /// A task handle with no process yet.
    #[must_use]
    pub fn new() -> Self {
        Self { pid: None }
    }

    /// Pid of the running process, if any.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// True while a process is attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Runs the launch protocol described in the module docs.
    ///
    /// # Errors
    ///
    /// Returns an error when any fork/pipe step fails or the child
    /// reports a setup or exec failure through the status pipe.
    pub fn start(&mut self, env: &TaskEnv) -> Result<()> {
        let words = split_command(&env.command)?;

        let (rfd, wfd) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| {
                WardenError::errno("pipe2", e)
            })?;

        // SAFETY: the child half only runs exec-or-exit code paths.
        let fork = unsafe { nix::unistd::fork() }
            .map_err(|e| WardenError::errno("fork", e))?;
        match fork {
            ForkResult::Parent { child: helper } => {
                drop(wfd);
                let _ = nix::sys::wait::waitpid(helper, None);
                self.read_launch_report(rfd)
            }
            ForkResult::Child => {
                drop(rfd);
                let code = intermediate_main(env, &words, &wfd);
                std::process::exit(code);
            }
        }
    }

    fn read_launch_report(&mut self, rfd: OwnedFd) -> Result<()> {
        let mut pipe = std::fs::File::from(rfd);

        let mut word = [0_u8; 4];
        pipe.read_exact(&mut word).map_err(|e| {
            WardenError::io("launch pipe (pid)", e)
        })?;
        let pid = i32::from_ne_bytes(word);
        if pid <= 0 {
            return Err(WardenError::errno(
                "clone child",
                nix::errno::Errno::from_raw(-pid.min(0)),
            ));
        }

        match pipe.read(&mut word) {
            // Pipe closed without a status word: exec succeeded.
            Ok(0) => {
                self.pid = Some(Pid::from_raw(pid));
                tracing::debug!(pid, "task started");
                Ok(())
            }
            Ok(_) => {
                let code = i32::from_ne_bytes(word);
                let errno = nix::errno::Errno::from_raw(code.abs());
                let stage = if code < 0 { "child prepare" } else { "child exec" };
                Err(WardenError::errno(stage, errno))
            }
            Err(e) => Err(WardenError::io("launch pipe (status)", e)),
        }
    }

    /// Signals the primary process directly.
    ///
    /// # Errors
    ///
    /// Returns `invalid-state` without a process, or the kill errno.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| WardenError::InvalidState("task is not running".into()))?;
        nix::sys::signal::kill(pid, signal)
            .map_err(|e| WardenError::errno(format!("kill({pid})"), e))
    }

    /// Forgets the process after its exit status was delivered.
    pub fn deliver_exit(&mut self) {
        self.pid = None;
    }

    /// Re-attaches to a remembered pid after daemon restart and
    /// classifies what was found.
    ///
    /// A live pid whose freezer cgroup no longer matches the container's
    /// is reported [`RestoredTask::Lost`]; such a container is treated as
    /// dead on the next state sync.
    #[must_use]
    pub fn restore(&mut self, pid: Pid, expected_freezer: &str) -> RestoredTask {
        let status = classify_pid(pid, expected_freezer);
        match status {
            RestoredTask::Running | RestoredTask::Zombie => self.pid = Some(pid),
            RestoredTask::Dead | RestoredTask::Lost => self.pid = None,
        }
        tracing::debug!(pid = pid.as_raw(), ?status, "task restored");
        status
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// Probes `/proc/<pid>` and the freezer membership of a restored pid.
fn classify_pid(pid: Pid, expected_freezer: &str) -> RestoredTask {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(_) => return RestoredTask::Dead,
    };
    // State is the first field after the parenthesized comm.
    let zombie = stat
        .rsplit(')')
        .next()
        .and_then(|rest| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z");
    if zombie {
        return RestoredTask::Zombie;
    }
    if in_freezer(pid, expected_freezer) {
        RestoredTask::Running
    } else {
        RestoredTask::Lost
    }
}

/// Checks the freezer line of `/proc/<pid>/cgroup` against the expected
/// container path.
fn in_freezer(pid: Pid, expected: &str) -> bool {
    let Ok(cgroups) = std::fs::read_to_string(format!("/proc/{pid}/cgroup")) else {
        return false;
    };
    cgroups.lines().any(|line| {
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next();
        let controllers = fields.next().unwrap_or("");
        let path = fields.next().unwrap_or("");
        controllers.split(',').any(|c| c == "freezer")
            && path.trim_start_matches('/') == expected.trim_start_matches('/')
    })
}

/// Truncates a stdio file back to zero when it outgrew the cap.
///
/// # Errors
///
/// Returns an error if the size probe or truncation fails.
pub fn rotate_file(path: &Path, max_size: u64) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(WardenError::io(path, e)),
    };
    if metadata.len() > max_size {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| WardenError::io(path, e))?;
        file.set_len(0).map_err(|e| WardenError::io(path, e))?;
        tracing::debug!(path = %path.display(), "rotated stdio file");
    }
    Ok(())
}

/// Reads up to `max_bytes` from the tail of a stdio file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<String> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(WardenError::io(path, e)),
    };
    let skip = data.len().saturating_sub(usize::try_from(max_bytes).unwrap_or(usize::MAX));
    Ok(String::from_utf8_lossy(&data[skip..]).into_owned())
}

// ---- child-side helpers; everything below runs post-fork and must only
// ---- exit through exec or _exit.

/// Runs in the intermediate process: unshare namespaces, fork the real
/// child, report its pid, exit.
fn intermediate_main(env: &TaskEnv, words: &[String], wfd: &OwnedFd) -> i32 {
    let _ = nix::unistd::setsid();

    if let Err(e) = nix::sched::unshare(
        CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS,
    ) {
        report_word(wfd, -(e as i32));
        return 1;
    }

    // SAFETY: the child half only runs exec-or-exit code paths.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            report_word(wfd, child.as_raw());
            0
        }
        Ok(ForkResult::Child) => {
            let errno = child_main(env, words, wfd);
            report_word(wfd, errno);
            1
        }
        Err(e) => {
            report_word(wfd, -(e as i32));
            1
        }
    }
}

/// Writes one status word into the pipe; failures are unreportable at
/// this point and the parent treats a short pipe as an error anyway.
fn report_word(wfd: &OwnedFd, word: i32) {
    let bytes = word.to_ne_bytes();
    // SAFETY: writes 4 bytes from a valid buffer to a pipe we own.
    let _ = unsafe { libc::write(wfd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
}

/// Child setup sequence; returns the errno to report on failure and
/// never returns on success. Negative values mark pre-exec failures,
/// positive values an exec failure, matching the status-word protocol.
fn child_main(env: &TaskEnv, words: &[String], wfd: &OwnedFd) -> i32 {
    macro_rules! try_prep {
        ($e:expr) => {
            match $e {
                Ok(value) => value,
                Err(errno) => return -(errno as i32),
            }
        };
    }

    reset_signal_handlers();
    // SAFETY: plain prctl flag clear.
    unsafe {
        libc::prctl(libc::PR_SET_KEEPCAPS, 0, 0, 0, 0);
    }
    try_prep!(nix::unistd::setsid());

    if !env.hostname.is_empty() {
        try_prep!(nix::unistd::sethostname(&env.hostname));
    }

    for ulimit in &env.ulimits {
        try_prep!(nix::sys::resource::setrlimit(
            ulimit.resource,
            ulimit.soft,
            ulimit.hard
        ));
    }

    try_prep!(setup_mounts());
    for procs in &env.cgroup_procs {
        if let Err(e) = std::fs::write(procs, std::process::id().to_string()) {
            return -e.raw_os_error().unwrap_or(libc::EIO);
        }
    }

    let keep = wfd.as_raw_fd();
    close_all_fds(keep);
    if let Err(errno) = setup_stdio(env) {
        return -(errno as i32);
    }

    try_prep!(enter_root(env));
    if env.cwd.as_os_str().is_empty() {
        try_prep!(nix::unistd::chdir("/"));
    } else {
        try_prep!(nix::unistd::chdir(&env.cwd));
    }

    try_prep!(nix::unistd::setgid(Gid::from_raw(env.gid)));
    let Ok(user) = CString::new(env.user.as_str()) else {
        return -libc::EINVAL;
    };
    try_prep!(nix::unistd::initgroups(&user, Gid::from_raw(env.gid)));
    try_prep!(nix::unistd::setuid(Uid::from_raw(env.uid)));

    let Ok(argv) = words
        .iter()
        .map(|w| CString::new(w.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
    else {
        return -libc::EINVAL;
    };
    let Ok(envp) = env
        .environ
        .iter()
        .map(|e| CString::new(e.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
    else {
        return -libc::EINVAL;
    };

    match nix::unistd::execvpe(&argv[0], &argv, &envp) {
        Ok(infallible) => match infallible {},
        Err(errno) => errno as i32,
    }
}

fn reset_signal_handlers() {
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing the default disposition is always sound.
        let _ = unsafe { nix::sys::signal::signal(sig, nix::sys::signal::SigHandler::SigDfl) };
    }
}

fn close_all_fds(keep: i32) {
    // SAFETY: plain sysconf query.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = i32::try_from(max.max(1024)).unwrap_or(i32::MAX);
    for fd in 0..max {
        if fd != keep {
            // SAFETY: closing unowned fds is the point of this sweep; the
            // process execs or exits immediately after.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Opens fds 0/1/2 with raw syscalls; the fd table was just swept clean,
/// so wrappers that assume ownership do not apply here.
fn setup_stdio(env: &TaskEnv) -> std::result::Result<(), nix::errno::Errno> {
    open_stdio("/dev/null", libc::O_RDONLY, env, 0)?;
    let out_flags = libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND;
    open_stdio(&env.stdout_path.to_string_lossy(), out_flags, env, 1)?;
    open_stdio(&env.stderr_path.to_string_lossy(), out_flags, env, 2)?;
    Ok(())
}

fn open_stdio(
    path: &str,
    flags: i32,
    env: &TaskEnv,
    target: i32,
) -> std::result::Result<(), nix::errno::Errno> {
    let Ok(cpath) = CString::new(path) else {
        return Err(nix::errno::Errno::EINVAL);
    };
    // SAFETY: cpath is a valid NUL-terminated string for the whole call.
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o640) };
    if fd < 0 {
        return Err(nix::errno::Errno::last());
    }
    if target > 0 {
        // SAFETY: fd was just opened; chown failures on foreign
        // filesystems are tolerated.
        unsafe {
            libc::fchown(fd, env.uid, env.gid);
        }
    }
    if fd != target {
        // SAFETY: target is one of the standard fd numbers.
        let ret = unsafe { libc::dup2(fd, target) };
        // SAFETY: fd is owned by this function.
        unsafe {
            libc::close(fd);
        }
        if ret < 0 {
            return Err(nix::errno::Errno::last());
        }
    }
    Ok(())
}

fn setup_mounts() -> std::result::Result<(), nix::errno::Errno> {
    // Keep our mount changes out of the host namespace.
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    // Fresh procfs so the new PID namespace is visible.
    nix::mount::mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    Ok(())
}

fn enter_root(env: &TaskEnv) -> std::result::Result<(), nix::errno::Errno> {
    if env.root.as_os_str().is_empty() || env.root == Path::new("/") {
        return Ok(());
    }

    nix::mount::mount(
        Some(&env.root),
        &env.root,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;

    for bind in &env.binds {
        let target = env.root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target));
        nix::mount::mount(
            Some(&bind.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
        if bind.read_only {
            nix::mount::mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
    }

    nix::mount::mount(
        Some("proc"),
        &env.root.join("proc"),
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;

    if env.root_read_only {
        nix::mount::mount(
            None::<&str>,
            &env.root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
    }

    nix::unistd::chdir(&env.root)?;
    nix::unistd::chroot(".")?;
    nix::unistd::chdir("/")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_command("sleep 1000").unwrap(),
            vec!["sleep".to_string(), "1000".to_string()]
        );
    }

    #[test]
    fn split_quoted_words() {
        assert_eq!(
            split_command(r#"echo "hello world" 'a b'"#).unwrap(),
            vec!["echo".to_string(), "hello world".to_string(), "a b".to_string()]
        );
    }

    #[test]
    fn metacharacters_are_rejected() {
        for bad in ["a | b", "a && b", "a; b", "a > /tmp/x", "echo $(id)", "a `id`"] {
            assert!(split_command(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn quoted_metacharacters_pass_through() {
        assert_eq!(
            split_command(r#"grep "a|b" file"#).unwrap(),
            vec!["grep".to_string(), "a|b".to_string(), "file".to_string()]
        );
    }

    #[test]
    fn unbalanced_quote_is_rejected() {
        assert!(split_command("echo \"oops").is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(split_command("").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn missing_pid_classifies_dead() {
        // Pid numbers above the default pid_max cannot exist.
        let status = classify_pid(Pid::from_raw(i32::MAX - 1), "warden/x");
        assert_eq!(status, RestoredTask::Dead);
    }

    #[test]
    fn rotate_ignores_missing_file() {
        rotate_file(Path::new("/nonexistent/stdout"), 1024).unwrap();
    }

    #[test]
    fn rotate_truncates_oversized_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        std::fs::write(&path, vec![b'x'; 2048]).unwrap();
        rotate_file(&path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn rotate_keeps_small_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"short").unwrap();
        rotate_file(&path, 1024).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn tail_returns_last_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_tail(&path, 4).unwrap(), "6789");
        assert_eq!(read_tail(&path, 100).unwrap(), "0123456789");
        assert_eq!(read_tail(&dir.path().join("missing"), 4).unwrap(), "");
    }

    #[test]
    fn ulimit_entries_parse() {
        let limit = parse_ulimit("nofile 1024 4096").unwrap();
        assert_eq!(limit.soft, 1024);
        assert_eq!(limit.hard, 4096);

        let limit = parse_ulimit("core 0 unlimited").unwrap();
        assert_eq!(limit.soft, 0);
        assert_eq!(limit.hard, nix::sys::resource::RLIM_INFINITY);

        assert!(parse_ulimit("nofile 1024").is_err());
        assert!(parse_ulimit("widgets 1 2").is_err());
        assert!(parse_ulimit("nofile many more").is_err());
    }

    #[test]
    fn prepared_env_fills_defaults() {
        let mut env = TaskEnv {
            command: "true".into(),
            user: "root".into(),
            ..TaskEnv::default()
        };
        env.prepare("a/b").unwrap();
        assert_eq!(env.uid, 0);
        assert!(env.environ.iter().any(|e| e == "WARDEN_NAME=a/b"));
        assert!(env.environ.iter().any(|e| e.starts_with("PATH=")));
        assert!(!env.cwd.as_os_str().is_empty());
    }

    #[test]
    fn unknown_user_is_invalid_value() {
        let mut env = TaskEnv {
            user: "no-such-user-here".into(),
            ..TaskEnv::default()
        };
        assert!(env.prepare("a").is_err());
    }
}
