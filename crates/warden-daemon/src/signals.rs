//! Async-signal-safe flags shared by the daemon roles.
//!
//! Handlers only flip atomics; the main loops read them between poll
//! rounds. Fatal signals are re-raised with the default disposition
//! after cleanup so the exit status reflects the signal.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Terminate the main loop.
pub static DONE: AtomicBool = AtomicBool::new(false);
/// Whether termination should also stop containers.
pub static CLEANUP: AtomicBool = AtomicBool::new(false);
/// Reload/upgrade request.
pub static HUP: AtomicBool = AtomicBool::new(false);
/// A child was reaped (master role).
pub static CHILD: AtomicBool = AtomicBool::new(false);
/// Signal to re-raise on exit, 0 for none.
pub static RAISE: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_exit(signum: i32) {
    DONE.store(true, Ordering::SeqCst);
    CLEANUP.store(false, Ordering::SeqCst);
    RAISE.store(signum, Ordering::SeqCst);
}

extern "C" fn on_exit_cleanup(signum: i32) {
    DONE.store(true, Ordering::SeqCst);
    CLEANUP.store(true, Ordering::SeqCst);
    RAISE.store(signum, Ordering::SeqCst);
}

extern "C" fn on_hup(_signum: i32) {
    HUP.store(true, Ordering::SeqCst);
}

extern "C" fn on_child(_signum: i32) {
    CHILD.store(true, Ordering::SeqCst);
}

fn install(signal: Signal, handler: SigHandler) {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handlers above only store to atomics.
    if let Err(e) = unsafe { nix::sys::signal::sigaction(signal, &action) } {
        tracing::warn!(signal = %signal, error = %e, "sigaction failed");
    }
}

/// Installs the shared dispositions for either role.
///
/// SIGPIPE is ignored (the pipes may close under us), SIGINT stops
/// containers before exiting, SIGTERM leaves them running, SIGQUIT keeps
/// its default for core dumps.
pub fn install_common() {
    install(Signal::SIGPIPE, SigHandler::SigIgn);
    install(Signal::SIGINT, SigHandler::Handler(on_exit_cleanup));
    install(Signal::SIGTERM, SigHandler::Handler(on_exit));
    install(Signal::SIGHUP, SigHandler::Handler(on_hup));
}

/// Additionally watches SIGCHLD; only the master reaps.
pub fn install_master() {
    install_common();
    install(Signal::SIGCHLD, SigHandler::Handler(on_child));
}

/// Restores defaults and re-raises the recorded fatal signal, if any.
pub fn reraise_if_fatal() {
    let signum = RAISE.load(Ordering::SeqCst);
    if signum == 0 {
        return;
    }
    if let Ok(signal) = Signal::try_from(signum) {
        install(signal, SigHandler::SigDfl);
        let _ = nix::sys::signal::raise(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_handlers_set_expected_flags() {
        on_exit(15);
        assert!(DONE.load(Ordering::SeqCst));
        assert!(!CLEANUP.load(Ordering::SeqCst));
        assert_eq!(RAISE.load(Ordering::SeqCst), 15);

        on_exit_cleanup(2);
        assert!(CLEANUP.load(Ordering::SeqCst));
        assert_eq!(RAISE.load(Ordering::SeqCst), 2);

        // Reset for other tests in this process.
        DONE.store(false, Ordering::SeqCst);
        CLEANUP.store(false, Ordering::SeqCst);
        RAISE.store(0, Ordering::SeqCst);
    }
}
