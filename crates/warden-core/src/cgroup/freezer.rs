//! Freezer control, used by pause/resume and the kill protocol.

use std::time::Duration;

use warden_common::error::{Result, WardenError};

use super::Cgroup;

const STATE: &str = "freezer.state";
const FROZEN: &str = "FROZEN";
const THAWED: &str = "THAWED";

/// Number of polls before a state wait gives up.
const WAIT_POLLS: u32 = 100;

/// Backoff between state polls.
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Freezes every task in the cgroup and waits for the steady state.
///
/// # Errors
///
/// Returns an error if the knob write fails or the cgroup never settles.
pub fn freeze(cg: &Cgroup<'_>) -> Result<()> {
    cg.set_knob(STATE, FROZEN)?;
    wait_state(cg, FROZEN)
}

/// Thaws the cgroup and waits for the steady state.
///
/// # Errors
///
/// Returns an error if the knob write fails or the cgroup never settles.
pub fn thaw(cg: &Cgroup<'_>) -> Result<()> {
    cg.set_knob(STATE, THAWED)?;
    wait_state(cg, THAWED)
}

/// True when the cgroup reports itself frozen.
#[must_use]
pub fn is_frozen(cg: &Cgroup<'_>) -> bool {
    cg.get_knob(STATE)
        .map_or(false, |s| s.trim() == FROZEN)
}

/// Polls `freezer.state` with bounded backoff until it matches `want`.
///
/// The kernel reports `FREEZING` while tasks are still being stopped, so
/// a freeze is not complete until the steady `FROZEN` shows up.
///
/// # Errors
///
/// Returns an error if the state does not settle within the poll budget.
pub fn wait_state(cg: &Cgroup<'_>, want: &str) -> Result<()> {
    for _ in 0..WAIT_POLLS {
        if cg.get_knob(STATE)?.trim() == want {
            return Ok(());
        }
        std::thread::sleep(WAIT_STEP);
    }
    Err(WardenError::errno(
        format!("freezer {cg} did not reach {want}"),
        nix::errno::Errno::ETIMEDOUT,
    ))
}
