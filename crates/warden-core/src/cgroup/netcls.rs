//! Network classifier ids, linking cgroups to traffic classes.

use warden_common::error::Result;

use super::Cgroup;

const CLASSID: &str = "net_cls.classid";

/// Tags every socket created in the cgroup with the given class handle.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_classid(cg: &Cgroup<'_>, classid: u32) -> Result<()> {
    cg.set_knob(CLASSID, &classid.to_string())
}

/// Reads the current class handle.
///
/// # Errors
///
/// Returns an error if the knob cannot be read or parsed.
pub fn classid(cg: &Cgroup<'_>) -> Result<u32> {
    let value = cg.get_knob_u64(CLASSID)?;
    Ok(u32::try_from(value).unwrap_or(0))
}
