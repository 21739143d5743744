//! Unprivileged execution identity.
//!
//! The only way to obtain an [`UnprivilegedUser`] is [`UnprivilegedUser::parse`],
//! so every spawner input has already been checked against root.

mod validation;

pub use validation::{validate_ids, validate_name};

use crate::config::types::{LauncherError, Result};
use std::fmt;

/// Numeric fallback identity (`nobody:nogroup`) for host execution.
pub const NOBODY_ID: u32 = 65534;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Principal {
    Id(u32),
    Name(String),
}

impl Principal {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.parse::<u32>() {
            Ok(0) => Err(LauncherError::Privilege(
                "Cannot run as root (id 0)".to_string(),
            )),
            Ok(id) => Ok(Principal::Id(id)),
            Err(_) => {
                validate_name(raw)?;
                Ok(Principal::Name(raw.to_string()))
            }
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Id(id) => write!(f, "{}", id),
            Principal::Name(name) => f.write_str(name),
        }
    }
}

/// A `user[:group]` identity guaranteed not to be root.
///
/// ```
/// use runbox::kernel::credentials::UnprivilegedUser;
///
/// assert!(UnprivilegedUser::parse("runner").is_ok());
/// assert!(UnprivilegedUser::parse("0:0").is_err());
/// ```
///
/// It cannot be assembled by hand:
///
/// ```compile_fail
/// use runbox::kernel::credentials::UnprivilegedUser;
///
/// let root = UnprivilegedUser { user: todo!(), group: None };
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnprivilegedUser {
    user: Principal,
    group: Option<Principal>,
}

impl UnprivilegedUser {
    /// Parse `user`, `uid`, `user:group` or `uid:gid`, rejecting root in every position.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (user, group) = match spec.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (spec, None),
        };

        Ok(Self {
            user: Principal::parse(user)?,
            group: group.map(Principal::parse).transpose()?,
        })
    }

    /// `nobody:nogroup` by numeric id
    pub fn nobody() -> Self {
        Self {
            user: Principal::Id(NOBODY_ID),
            group: Some(Principal::Id(NOBODY_ID)),
        }
    }

    /// Value for `docker run --user`
    pub fn as_docker_arg(&self) -> String {
        self.to_string()
    }

    /// Numeric uid/gid to switch to when spawning directly on the host.
    ///
    /// Names are looked up in the host user database; unknown names fall back to
    /// `nobody`. The result is validated again so a database entry mapping a
    /// name to 0 cannot slip through.
    pub fn host_ids(&self) -> Result<(u32, u32)> {
        let (uid, primary_gid) = match &self.user {
            Principal::Id(id) => (*id, None),
            Principal::Name(name) => match nix::unistd::User::from_name(name) {
                Ok(Some(user)) => (user.uid.as_raw(), Some(user.gid.as_raw())),
                _ => {
                    log::debug!("user '{}' not known on host, using nobody", name);
                    (NOBODY_ID, Some(NOBODY_ID))
                }
            },
        };

        let gid = match &self.group {
            Some(Principal::Id(id)) => *id,
            Some(Principal::Name(name)) => match nix::unistd::Group::from_name(name) {
                Ok(Some(group)) => group.gid.as_raw(),
                _ => NOBODY_ID,
            },
            None => primary_gid.unwrap_or(NOBODY_ID),
        };

        validate_ids(uid, gid)?;
        Ok((uid, gid))
    }
}

impl fmt::Display for UnprivilegedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{}", self.user, group),
            None => write!(f, "{}", self.user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_user_is_accepted() {
        let user = UnprivilegedUser::parse("runner").unwrap();
        assert_eq!(user.as_docker_arg(), "runner");
    }

    #[test]
    fn numeric_pair_is_accepted() {
        let user = UnprivilegedUser::parse("1000:1000").unwrap();
        assert_eq!(user.to_string(), "1000:1000");
        assert_eq!(user.host_ids().unwrap(), (1000, 1000));
    }

    #[test]
    fn root_is_rejected_in_every_form() {
        for spec in ["root", "0", "0:1000", "1000:0", "runner:root", "Root:runner", " 0 "] {
            assert!(
                matches!(UnprivilegedUser::parse(spec), Err(LauncherError::Privilege(_))),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn nobody_maps_to_numeric_ids() {
        let user = UnprivilegedUser::nobody();
        assert_eq!(user.to_string(), "65534:65534");
        assert_eq!(user.host_ids().unwrap(), (NOBODY_ID, NOBODY_ID));
    }

    #[test]
    fn unknown_name_falls_back_to_nobody_on_host() {
        let user = UnprivilegedUser::parse("runbox-no-such-user").unwrap();
        assert_eq!(user.host_ids().unwrap(), (NOBODY_ID, NOBODY_ID));
    }
}
