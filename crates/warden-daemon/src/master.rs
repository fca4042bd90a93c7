//! The master role: subreaper, slave babysitter, exit-status courier.
//!
//! The master adopts every orphaned descendant, forwards each reaped
//! (pid, status) pair to the slave over the event pipe, and holds the
//! pair in a map until the slave acknowledges it. The map survives slave
//! crashes in memory and master self-upgrade on disk, so no exit status
//! is ever lost.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::ForkResult;

use warden_common::config::WardenConfig;
use warden_common::constants::{REAP_ACK_FD, REAP_EVT_FD};
use warden_common::error::{Result, WardenError};

use crate::signals;

/// Flags forwarded to a spawned slave.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlaveFlags {
    pub stdlog: bool,
    pub failsafe: bool,
    pub nonet: bool,
}

impl SlaveFlags {
    fn to_args(self) -> Vec<&'static str> {
        let mut args = vec!["--slave"];
        if self.stdlog {
            args.push("--stdlog");
        }
        if self.failsafe {
            args.push("--failsafe");
        }
        if self.nonet {
            args.push("--nonet");
        }
        args
    }
}

/// Runs the master until a termination signal.
///
/// # Errors
///
/// Returns an error for unrecoverable setup failures (subreaper, pipes).
pub fn run(config: &WardenConfig, flags: SlaveFlags) -> Result<i32> {
    signals::install_master();

    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| WardenError::errno("PR_SET_CHILD_SUBREAPER", e))?;
    // The supervisor must outlive memory pressure; its containers are
    // the ones meant to die.
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", "-1000") {
        tracing::warn!(error = %e, "oom_score_adj not applied");
    }

    let mut pid_map = load_pid_map(&config.daemon.pidmap_path);
    let _ = std::fs::remove_file(&config.daemon.pidmap_path);

    let mut exit_code = 0;
    while !signals::DONE.load(Ordering::SeqCst) {
        let respawn_at =
            Instant::now() + Duration::from_millis(config.daemon.slave_respawn_delay_ms);
        exit_code = babysit_slave(config, flags, &mut pid_map)?;

        if !signals::DONE.load(Ordering::SeqCst) {
            let now = Instant::now();
            if respawn_at > now {
                std::thread::sleep(respawn_at - now);
            }
        }
    }

    tracing::info!("master shutting down");
    signals::reraise_if_fatal();
    Ok(exit_code)
}

/// Spawns one slave and supervises it until it exits or we are told to
/// stop; returns the would-be process exit code.
fn babysit_slave(
    config: &WardenConfig,
    flags: SlaveFlags,
    pid_map: &mut BTreeMap<i32, i32>,
) -> Result<i32> {
    let (evt_read, evt_write) =
        nix::unistd::pipe().map_err(|e| WardenError::errno("pipe(evt)", e))?;
    let (ack_read, ack_write) =
        nix::unistd::pipe().map_err(|e| WardenError::errno("pipe(ack)", e))?;
    set_nonblocking(ack_read.as_raw_fd())?;

    // SAFETY: the child immediately re-execs this binary in slave mode.
    let slave_pid = match unsafe { nix::unistd::fork() }
        .map_err(|e| WardenError::errno("fork", e))?
    {
        ForkResult::Child => {
            let _ = nix::unistd::dup2(evt_read.as_raw_fd(), REAP_EVT_FD);
            let _ = nix::unistd::dup2(ack_write.as_raw_fd(), REAP_ACK_FD);
            drop(evt_read);
            drop(evt_write);
            drop(ack_read);
            drop(ack_write);
            exec_self(&flags.to_args());
            std::process::exit(1);
        }
        ForkResult::Parent { child } => child,
    };
    drop(evt_read);
    drop(ack_write);

    tracing::info!(slave = slave_pid.as_raw(), "slave spawned");

    // Statuses reaped while no slave was alive are re-delivered first.
    for (&pid, &status) in pid_map.iter() {
        send_pid_status(&evt_write, pid, status);
    }

    loop {
        if signals::HUP.load(Ordering::SeqCst) {
            signals::HUP.store(false, Ordering::SeqCst);
            tracing::info!("upgrade requested, re-executing master");
            save_pid_map(&config.daemon.pidmap_path, pid_map);
            let _ = nix::sys::signal::kill(slave_pid, Signal::SIGKILL);
            let _ = nix::sys::wait::waitpid(slave_pid, None);
            let mut args = vec![];
            if flags.stdlog {
                args.push("--stdlog");
            }
            exec_self(&args);
            return Err(WardenError::errno(
                "execv(/proc/self/exe)",
                nix::errno::Errno::last(),
            ));
        }

        if signals::DONE.load(Ordering::SeqCst) {
            tracing::info!("terminating slave");
            let _ = nix::sys::signal::kill(slave_pid, Signal::SIGINT);
            let _ = nix::sys::wait::waitpid(slave_pid, None);
            return Ok(0);
        }

        // Wake on acks, or once a second to sweep for reaped children
        // whose SIGCHLD raced the poll.
        let mut fds = [PollFd::new(ack_read.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(1000_u16)) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(WardenError::errno("poll(ack)", e)),
        }

        drain_acks(ack_read.as_raw_fd(), pid_map);

        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: status points at a valid int for the call.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if pid == slave_pid.as_raw() {
                tracing::warn!(status, "slave exited");
                return Ok(if status == 0 { 0 } else { 1 });
            }
            tracing::debug!(pid, status, queued = pid_map.len(), "descendant reaped");
            send_pid_status(&evt_write, pid, status);
            pid_map.insert(pid, status);
        }
    }
}

fn exec_self(extra_args: &[&str]) {
    let (Ok(exe), Ok(argv0)) = (CString::new("/proc/self/exe"), CString::new("wardend"))
    else {
        return;
    };
    let mut argv = vec![argv0];
    argv.extend(
        extra_args
            .iter()
            .filter_map(|a| CString::new(*a).ok()),
    );
    let _ = nix::unistd::execv(&exe, &argv);
    tracing::error!(error = %nix::errno::Errno::last(), "exec of self failed");
}

/// Writes one (pid, status) record into the event pipe.
fn send_pid_status(evt_write: &OwnedFd, pid: i32, status: i32) {
    let mut record = [0_u8; 8];
    record[..4].copy_from_slice(&pid.to_ne_bytes());
    record[4..].copy_from_slice(&status.to_ne_bytes());
    let mut file = std::fs::File::from(match evt_write.try_clone() {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "event pipe clone failed");
            return;
        }
    });
    if let Err(e) = file.write_all(&record) {
        tracing::error!(pid, error = %e, "exit status delivery failed");
    }
}

/// Consumes every pending ack; each removes the pid from the map.
fn drain_acks(ack_fd: i32, pid_map: &mut BTreeMap<i32, i32>) {
    loop {
        let mut buf = [0_u8; 4];
        // SAFETY: buf is a 4-byte writable buffer.
        let n = unsafe { libc::read(ack_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n != 4 {
            return;
        }
        let pid = i32::from_ne_bytes(buf);
        pid_map.remove(&pid);
        tracing::debug!(pid, queued = pid_map.len(), "acknowledge received");
    }
}

fn set_nonblocking(fd: i32) -> Result<()> {
    // SAFETY: plain fcntl on a fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(WardenError::errno("F_GETFL", nix::errno::Errno::last()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(WardenError::errno("F_SETFL", nix::errno::Errno::last()));
    }
    Ok(())
}

/// Persists the unacknowledged map across a master self-upgrade.
fn save_pid_map(path: &Path, pid_map: &BTreeMap<i32, i32>) {
    let mut body = String::new();
    for (pid, status) in pid_map {
        body.push_str(&format!("{pid} {status}\n"));
    }
    if let Err(e) = std::fs::write(path, body) {
        tracing::error!(error = %e, "pid map not saved");
    }
}

/// Restores the map a previous master saved before re-exec.
fn load_pid_map(path: &Path) -> BTreeMap<i32, i32> {
    let mut map = BTreeMap::new();
    let Ok(body) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in body.lines() {
        let mut words = line.split_whitespace();
        let pid = words.next().and_then(|w| w.parse::<i32>().ok());
        let status = words.next().and_then(|w| w.parse::<i32>().ok());
        if let (Some(pid), Some(status)) = (pid, status) {
            map.insert(pid, status);
        }
    }
    tracing::info!(entries = map.len(), "pid map restored");
    map
}
