//! Device access allowlisting.

use warden_common::error::{Result, WardenError};

use super::Cgroup;

const DENY: &str = "devices.deny";
const ALLOW: &str = "devices.allow";

/// Replaces the cgroup's device policy with deny-all plus the given
/// allowlist entries.
///
/// Each entry uses the kernel's `<type> <major>:<minor> <access>` syntax,
/// e.g. `c 1:3 rwm`. An empty list leaves full access in place, matching
/// the default for containers without a device allowlist.
///
/// # Errors
///
/// Returns `invalid-value` for a malformed entry or an error from the
/// knob writes.
pub fn apply_allowlist(cg: &Cgroup<'_>, entries: &[String]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    for entry in entries {
        validate_entry(entry)?;
    }
    cg.set_knob(DENY, "a")?;
    for entry in entries {
        cg.set_knob(ALLOW, entry)?;
    }
    tracing::debug!(cgroup = %cg, entries = entries.len(), "device allowlist applied");
    Ok(())
}

/// Checks one allowlist entry against the kernel syntax.
fn validate_entry(entry: &str) -> Result<()> {
    let mut parts = entry.split_whitespace();
    let kind = parts.next();
    let numbers = parts.next();
    let access = parts.next();
    let ok = matches!(kind, Some("a" | "b" | "c"))
        && numbers.is_some_and(|n| {
            let mut split = n.splitn(2, ':');
            let major = split.next().unwrap_or("");
            let minor = split.next().unwrap_or("");
            (major == "*" || major.parse::<u32>().is_ok())
                && (minor == "*" || minor.parse::<u32>().is_ok())
        })
        && access.is_some_and(|a| !a.is_empty() && a.chars().all(|c| "rwm".contains(c)))
        && parts.next().is_none();
    if ok {
        Ok(())
    } else {
        Err(WardenError::InvalidValue(format!(
            "bad device entry {entry:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{Subsystem, SubsystemKind};

    #[test]
    fn entry_validation() {
        validate_entry("c 1:3 rwm").unwrap();
        validate_entry("b 8:* rw").unwrap();
        validate_entry("a *:* rwm").unwrap();
        assert!(validate_entry("").is_err());
        assert!(validate_entry("x 1:3 rwm").is_err());
        assert!(validate_entry("c 1-3 rwm").is_err());
        assert!(validate_entry("c 1:3 rwx").is_err());
        assert!(validate_entry("c 1:3 rwm extra").is_err());
    }

    #[test]
    fn allowlist_denies_then_allows() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("devices")).unwrap();
        let subsystem = Subsystem::probe(SubsystemKind::Devices, dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();

        apply_allowlist(&cg, &["c 1:3 rwm".into()]).unwrap();
        assert_eq!(cg.get_knob(DENY).unwrap(), "a");
        assert_eq!(cg.get_knob(ALLOW).unwrap(), "c 1:3 rwm");
    }

    #[test]
    fn empty_allowlist_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("devices")).unwrap();
        let subsystem = Subsystem::probe(SubsystemKind::Devices, dir.path());
        let cg = subsystem.cgroup("warden/a");
        cg.create().unwrap();
        apply_allowlist(&cg, &[]).unwrap();
        assert!(!cg.has_knob(DENY) || cg.get_knob(DENY).unwrap().is_empty());
    }
}
