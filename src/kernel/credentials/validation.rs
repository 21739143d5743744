//! Credential validation logic.

use crate::config::types::{LauncherError, Result};

/// Names that always map to the superuser inside common base images.
const PRIVILEGED_NAMES: &[&str] = &["root", "toor", "admin"];

/// Reject root UIDs/GIDs (0). There is no permissive override.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(LauncherError::Privilege(format!(
            "Cannot run as root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}

/// Reject a user or group name that resolves to the superuser.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LauncherError::Privilege("empty user or group name".to_string()));
    }
    if PRIVILEGED_NAMES
        .iter()
        .any(|privileged| name.eq_ignore_ascii_case(privileged))
    {
        return Err(LauncherError::Privilege(format!(
            "Cannot run as privileged identity '{}'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(LauncherError::Privilege(format!(
            "Invalid characters in identity '{}'",
            name
        )));
    }
    Ok(())
}
