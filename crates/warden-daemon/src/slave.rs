//! The slave role: owns the container state and serves clients.
//!
//! One poll loop demultiplexes the control socket, the reap pipe from
//! the master, connected clients, and every armed OOM eventfd; expired
//! timers are delivered before fd events each round.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use warden_common::config::WardenConfig;
use warden_common::constants::{CGROUP_ROOT, REAP_ACK_FD, REAP_EVT_FD};
use warden_common::error::{Result, WardenError};
use warden_runtime::container::Actions;
use warden_runtime::context::RuntimeContext;
use warden_runtime::event::Event;
use warden_runtime::holder::Holder;

use crate::rpc::{self, Client, Dispatch, Response};
use crate::signals;

/// What each poll slot refers to.
#[derive(Debug, Clone, Copy)]
enum Source {
    Listener,
    Reap,
    Client(RawFd),
    Oom(RawFd),
}

/// Runs the slave until a termination signal.
///
/// # Errors
///
/// Returns an error for unrecoverable initialization failures; with
/// `failsafe` some of them degrade to warnings.
pub fn run(config: WardenConfig, failsafe: bool, nonet: bool) -> Result<i32> {
    signals::install_common();

    if another_instance_running(&config.daemon.rpc_socket) {
        return Err(WardenError::InvalidState(
            "another wardend instance owns the control socket".into(),
        ));
    }

    for fd in [REAP_EVT_FD, REAP_ACK_FD] {
        if let Err(e) = set_cloexec(fd) {
            tracing::error!(fd, error = %e, "cannot set close-on-exec on reap pipe");
            if !failsafe {
                return Err(e);
            }
        }
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    // The master runs protected at -1000; the slave must stay killable.
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", "0") {
        tracing::warn!(error = %e, "oom_score_adj not reset");
    }

    let ctx = RuntimeContext::new(config.clone(), Path::new(CGROUP_ROOT), !nonet)?;
    let mut holder = Holder::new(ctx)?;
    let restored = holder.restore_all()?;
    if restored == 0 {
        // Nothing survived; clear scratch leftovers from a previous run.
        let tmp = &config.container.tmp_dir;
        if tmp.exists() {
            tracing::info!(path = %tmp.display(), "removing container leftovers");
            if let Err(e) = std::fs::remove_dir_all(tmp) {
                tracing::warn!(error = %e, "leftover removal failed");
            }
        }
    }

    let listener = bind_listener(&config.daemon.rpc_socket)?;
    let read_timeout = Duration::from_secs(config.daemon.read_timeout_s);
    let mut clients: HashMap<RawFd, Client> = HashMap::new();
    let mut next_token: u64 = 1;

    tracing::info!(socket = %config.daemon.rpc_socket.display(), restored, "slave ready");

    while !signals::DONE.load(Ordering::SeqCst) {
        if signals::HUP.load(Ordering::SeqCst) {
            signals::HUP.store(false, Ordering::SeqCst);
            match WardenConfig::load(Path::new(warden_common::constants::CONFIG_PATH)) {
                Ok(fresh) => {
                    tracing::info!("configuration reloaded");
                    holder.ctx.config = fresh;
                }
                Err(e) => tracing::error!(error = %e, "configuration reload failed"),
            }
        }

        let now = Instant::now();
        let mut actions = holder.process_expired(now);

        let oom_sources = holder.oom_sources();
        let mut fds: Vec<PollFd> = Vec::with_capacity(2 + clients.len() + oom_sources.len());
        let mut sources: Vec<Source> = Vec::with_capacity(fds.capacity());

        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        sources.push(Source::Listener);
        // SAFETY: the master dup'ed the reap pipe onto this fixed fd
        // before exec of the slave role; it stays open for our lifetime.
        let reap_fd = unsafe { BorrowedFd::borrow_raw(REAP_EVT_FD) };
        fds.push(PollFd::new(reap_fd, PollFlags::POLLIN));
        sources.push(Source::Reap);
        for (fd, client) in &clients {
            fds.push(PollFd::new(
                client.stream.as_fd(),
                PollFlags::POLLIN | PollFlags::POLLHUP,
            ));
            sources.push(Source::Client(*fd));
        }
        for (fd, _) in &oom_sources {
            // SAFETY: the eventfd is owned by a live container; it is
            // removed from the holder before being closed.
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            sources.push(Source::Oom(*fd));
        }

        let timeout = holder
            .next_timeout(now)
            .map_or(PollTimeout::MAX, |d| {
                PollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX))
            });
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "poll failed");
                break;
            }
        }

        let ready: Vec<(Source, PollFlags)> = fds
            .iter()
            .zip(sources.iter())
            .filter_map(|(pfd, src)| {
                pfd.revents()
                    .filter(|r| !r.is_empty())
                    .map(|r| (*src, r))
            })
            .collect();
        drop(fds);

        for (source, revents) in ready {
            match source {
                Source::Listener => {
                    accept_clients(&listener, &holder, &mut clients, &config, read_timeout);
                }
                Source::Reap => drain_reap_pipe(&mut holder, &mut actions),
                Source::Client(fd) => {
                    let close = if revents.contains(PollFlags::POLLIN) {
                        handle_client(&mut holder, &mut clients, fd, &mut next_token, &mut actions)
                    } else {
                        true
                    };
                    if close || revents.contains(PollFlags::POLLHUP) {
                        close_client(&mut clients, fd);
                    }
                }
                Source::Oom(fd) => {
                    let mut oom = holder.deliver_event(Event::Oom { fd });
                    merge_actions(&mut actions, &mut oom);
                }
            }
        }

        carry_out(&mut holder, &mut clients, &actions);
    }

    tracing::info!("slave shutting down");
    let _ = std::fs::remove_file(&config.daemon.rpc_socket);
    for (_, client) in clients.drain() {
        drop(client);
    }

    if signals::CLEANUP.load(Ordering::SeqCst) {
        for name in holder.list() {
            if !name.contains('/') {
                if let Err(e) = holder.stop(&name, warden_common::types::Cred::root()) {
                    tracing::warn!(container = %name, error = %e, "shutdown stop failed");
                }
            }
        }
    }

    signals::reraise_if_fatal();
    Ok(0)
}

fn another_instance_running(socket: &Path) -> bool {
    UnixStream::connect(socket).is_ok()
}

fn bind_listener(socket: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
    }
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket).map_err(|e| WardenError::io(socket, e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| WardenError::io(socket, e))?;
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o666);
    std::fs::set_permissions(socket, mode).map_err(|e| WardenError::io(socket, e))?;
    Ok(listener)
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl on a numeric fd; failure is reported.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(WardenError::errno("F_GETFD", nix::errno::Errno::last()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(WardenError::errno("F_SETFD", nix::errno::Errno::last()));
    }
    Ok(())
}

fn accept_clients(
    listener: &UnixListener,
    holder: &Holder,
    clients: &mut HashMap<RawFd, Client>,
    config: &WardenConfig,
    read_timeout: Duration,
) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if clients.len() >= config.daemon.max_clients {
                    tracing::warn!("client limit reached, dropping connection");
                    continue;
                }
                match Client::accept(stream, holder, read_timeout) {
                    Ok(client) => {
                        clients.insert(client.stream.as_raw_fd(), client);
                    }
                    Err(e) => tracing::warn!(error = %e, "client attribution failed"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Reads exactly `N` bytes from a raw fd, retrying short reads.
fn read_exact_raw<const N: usize>(fd: RawFd) -> Option<[u8; N]> {
    let mut buf = [0_u8; N];
    let mut filled = 0;
    while filled < N {
        // SAFETY: the remaining buffer slice is writable.
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr().cast(),
                N - filled,
            )
        };
        if n <= 0 {
            return None;
        }
        filled += usize::try_from(n).unwrap_or(0);
    }
    Some(buf)
}

fn reap_readable() -> bool {
    let mut pfd = libc::pollfd {
        fd: REAP_EVT_FD,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd for the whole call.
    unsafe { libc::poll(&mut pfd, 1, 0) == 1 && (pfd.revents & libc::POLLIN) != 0 }
}

/// Drains every queued (pid, status) record from the master.
fn drain_reap_pipe(holder: &mut Holder, actions: &mut Actions) {
    // Bounded so a babbling pipe cannot starve the loop.
    for _ in 0..1000 {
        if !reap_readable() {
            return;
        }
        let Some(pid_bytes) = read_exact_raw::<4>(REAP_EVT_FD) else {
            return;
        };
        let Some(status_bytes) = read_exact_raw::<4>(REAP_EVT_FD) else {
            return;
        };
        let pid = i32::from_ne_bytes(pid_bytes);
        let status = i32::from_ne_bytes(status_bytes);
        tracing::debug!(pid, status, "exit status from master");
        let mut delivered = holder.deliver_event(Event::Exit { pid, status });
        merge_actions(actions, &mut delivered);
    }
}

/// Acknowledges one reaped pid back to the master.
fn ack_pid(pid: i32) {
    let bytes = pid.to_ne_bytes();
    // SAFETY: writes 4 bytes from a valid buffer to the ack pipe.
    let n = unsafe { libc::write(REAP_ACK_FD, bytes.as_ptr().cast(), bytes.len()) };
    if n == bytes.len() as isize {
        tracing::debug!(pid, "exit status acknowledged");
    } else {
        tracing::error!(pid, "exit status acknowledgement failed");
    }
}

/// Serves one request from a connected client; true means close it.
fn handle_client(
    holder: &mut Holder,
    clients: &mut HashMap<RawFd, Client>,
    fd: RawFd,
    next_token: &mut u64,
    actions: &mut Actions,
) -> bool {
    let Some(client) = clients.get_mut(&fd) else {
        return false;
    };

    let frame = match rpc::read_frame(&mut client.stream) {
        Ok(frame) => frame,
        // A read that only hit the per-request timeout aborts this
        // request, not the connection.
        Err(WardenError::Io { source, .. })
            if matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            tracing::debug!(fd, "client read timed out");
            return false;
        }
        Err(e) => {
            tracing::debug!(fd, error = %e, "client read failed");
            return true;
        }
    };
    let request: rpc::Request = match serde_json::from_slice(&frame) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(fd, error = %e, "malformed request");
            let response = Response::from_error(&WardenError::InvalidValue(
                "malformed request".into(),
            ));
            let _ = rpc::send_response(&mut client.stream, &response);
            return true;
        }
    };

    let token = *next_token;
    *next_token += 1;
    match rpc::dispatch(holder, client, &request, token, actions) {
        Dispatch::Reply(response) => {
            rpc::send_response(&mut client.stream, &response).is_err()
        }
        Dispatch::Parked => false,
    }
}

fn close_client(clients: &mut HashMap<RawFd, Client>, fd: RawFd) {
    if let Some(client) = clients.remove(&fd) {
        tracing::debug!(pid = client.pid, "client disconnected");
    }
}

/// Performs the side effects a batch of operations produced: answer
/// parked waiters and acknowledge consumed exit statuses.
fn carry_out(holder: &mut Holder, clients: &mut HashMap<RawFd, Client>, actions: &Actions) {
    for pid in &actions.ack_pids {
        ack_pid(*pid);
    }
    for note in &actions.notified {
        let target = clients
            .values_mut()
            .find(|c| c.waiting == Some(note.token));
        let Some(client) = target else {
            // The client hung up before its wait settled.
            continue;
        };
        client.waiting = None;
        let name = holder
            .relative_name(client.container, &note.name)
            .unwrap_or_else(|_| note.name.clone());
        let response = Response {
            value: Some(name),
            state: Some(note.state.to_string()),
            ..Response::default()
        };
        if let Err(e) = rpc::send_response(&mut client.stream, &response) {
            tracing::debug!(error = %e, "wait answer failed");
        }
    }
}

fn merge_actions(into: &mut Actions, from: &mut Actions) {
    into.notified.append(&mut from.notified);
    into.ack_pids.append(&mut from.ack_pids);
}
