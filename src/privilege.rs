//! # Privilege model: root detection, uid drop, capability trimming.
//!
//! When started as root the daemon must not stay root: it switches its
//! effective uid to the `-user` target while keeping a minimal capability
//! set, so it can still change uid for children, signal arbitrary pids, and
//! adjust their priority.
//!
//! ## Drop sequence (root only)
//! ```text
//! resolve -user NAME            → unknown user is fatal
//! prctl(PR_SET_KEEPCAPS, 1)     → capabilities survive the uid switch
//! setresuid(-1, uid, 0)         → effective uid drops, saved stays root
//! verify geteuid() != 0         → residual root is fatal
//! capset {setuid, kill, nice}   → permitted+effective trimmed
//! ```
//! Each failure has its own process exit status; the host launcher keys off
//! them (see [`PrivilegeError::exit_status`]).
//!
//! ## Rules
//! - `{user, "root"}` spawn targets are refused while privileged
//! - A non-empty `-limit-users` list restricts spawn targets to its members
//! - Unprivileged daemons skip all capability work; children run as the
//!   daemon's own user

use nix::unistd::{geteuid, getuid, User};
use thiserror::Error;

use crate::config::Config;
use crate::error::CommandError;

/// Privilege context shared with option validation and the kill path.
#[derive(Debug, Clone)]
pub struct Privilege {
    superuser: bool,
    limit_users: Vec<String>,
}

impl Privilege {
    /// Builds a context directly; `drop_privileges` is the production path.
    pub fn new(superuser: bool, limit_users: Vec<String>) -> Self {
        Self {
            superuser,
            limit_users,
        }
    }

    /// Context for a daemon that never had privileges.
    pub fn unprivileged() -> Self {
        Self::new(false, Vec::new())
    }

    /// True when the daemon started as root (and dropped to `-user`).
    pub fn superuser(&self) -> bool {
        self.superuser
    }

    /// Gates a `{user, Name}` spawn target.
    ///
    /// Refuses root while privileged, and anyone outside the allow-list
    /// when one was supplied at startup.
    pub fn check_spawn_user(&self, name: &str, uid: u32) -> Result<(), CommandError> {
        if self.superuser && uid == 0 {
            return Err(CommandError::Privilege(
                "Cannot run a command as root user".into(),
            ));
        }
        if !self.limit_users.is_empty() && !self.limit_users.iter().any(|u| u == name) {
            return Err(CommandError::Privilege(format!(
                "User {name} is not in the list of allowed users"
            )));
        }
        Ok(())
    }
}

/// # Failures while dropping privileges.
///
/// All of these are fatal at startup; [`PrivilegeError::exit_status`] is the
/// contract with the host launcher.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PrivilegeError {
    /// `-user` names an unknown account.
    #[error("user {0} not found")]
    UnknownUser(String),

    /// Started as root without `-user`.
    #[error("when running as root, \"-user User\" option must be provided")]
    MissingUser,

    /// `prctl(PR_SET_KEEPCAPS)` failed.
    #[error("failed to keep capabilities across setuid: {0}")]
    KeepCaps(#[source] std::io::Error),

    /// `setresuid` failed.
    #[error("failed to set userid: {0}")]
    SetUid(#[source] std::io::Error),

    /// The effective uid is still 0 after the switch.
    #[error("failed to drop effective uid below root (euid={0})")]
    StillRoot(u32),

    /// The retained capability set could not be applied.
    #[error("failed to set cap_setuid/cap_kill/cap_sys_nice: {0}")]
    CapSet(#[source] std::io::Error),
}

impl PrivilegeError {
    /// Process exit status for this failure.
    pub fn exit_status(&self) -> i32 {
        match self {
            PrivilegeError::UnknownUser(_) => 3,
            PrivilegeError::MissingUser => 4,
            PrivilegeError::KeepCaps(_) => 5,
            PrivilegeError::SetUid(_) => 6,
            PrivilegeError::StillRoot(_) => 7,
            PrivilegeError::CapSet(_) => 9,
        }
    }
}

/// Detects whether the daemon is root and, if so, drops to `cfg.run_user`.
///
/// Returns the [`Privilege`] context the rest of the daemon consults. When
/// not started as root this is a no-op apart from recording the allow-list.
pub fn drop_privileges(cfg: &Config) -> Result<Privilege, PrivilegeError> {
    if !getuid().is_root() && !geteuid().is_root() {
        return Ok(Privilege::new(false, cfg.limit_users.clone()));
    }

    let name = cfg.run_user.as_deref().ok_or(PrivilegeError::MissingUser)?;
    let user = User::from_name(name)
        .ok()
        .flatten()
        .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?;
    let uid = user.uid.as_raw();
    if uid == 0 {
        // Dropping to root is not dropping.
        return Err(PrivilegeError::MissingUser);
    }

    keep_caps()?;

    // Effective uid drops to the target; the saved uid stays root so the
    // retained CAP_SETUID can still switch children to arbitrary users.
    // SAFETY: plain syscall wrapper, no memory is shared with the kernel.
    let rc = unsafe { libc::setresuid(libc::uid_t::MAX, uid, 0) };
    if rc != 0 {
        return Err(PrivilegeError::SetUid(std::io::Error::last_os_error()));
    }

    let euid = geteuid().as_raw();
    if euid == 0 {
        return Err(PrivilegeError::StillRoot(euid));
    }

    apply_capability_set()?;
    tracing::debug!(user = name, uid, "running with reduced privileges");

    Ok(Privilege::new(true, cfg.limit_users.clone()))
}

#[cfg(target_os = "linux")]
fn keep_caps() -> Result<(), PrivilegeError> {
    // SAFETY: prctl with integer arguments only.
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(PrivilegeError::KeepCaps(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn keep_caps() -> Result<(), PrivilegeError> {
    tracing::warn!("capability retention is not implemented for this platform");
    Ok(())
}

/// Trims permitted+effective capabilities to {CAP_SETUID, CAP_KILL,
/// CAP_SYS_NICE}.
#[cfg(target_os = "linux")]
fn apply_capability_set() -> Result<(), PrivilegeError> {
    const CAP_KILL: u32 = 5;
    const CAP_SETUID: u32 = 7;
    const CAP_SYS_NICE: u32 = 23;
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    #[repr(C)]
    struct CapHeader {
        version: u32,
        pid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Default)]
    struct CapData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let mask = (1 << CAP_KILL) | (1 << CAP_SETUID) | (1 << CAP_SYS_NICE);
    let header = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 uses two data slots; the retained caps all live in slot 0.
    let data = [
        CapData {
            effective: mask,
            permitted: mask,
            inheritable: 0,
        },
        CapData::default(),
    ];

    // SAFETY: header and data outlive the call; layouts match the kernel ABI.
    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc != 0 {
        return Err(PrivilegeError::CapSet(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_capability_set() -> Result<(), PrivilegeError> {
    tracing::warn!("capability trimming is not implemented for this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_context_allows_any_user() {
        let privilege = Privilege::unprivileged();
        assert!(privilege.check_spawn_user("root", 0).is_ok());
        assert!(privilege.check_spawn_user("nobody", 65534).is_ok());
    }

    #[test]
    fn privileged_context_refuses_root() {
        let privilege = Privilege::new(true, Vec::new());
        assert!(privilege.check_spawn_user("root", 0).is_err());
        assert!(privilege.check_spawn_user("nobody", 65534).is_ok());
    }

    #[test]
    fn allow_list_is_exact_match() {
        let privilege = Privilege::new(true, vec!["web".into(), "batch".into()]);
        assert!(privilege.check_spawn_user("web", 1000).is_ok());
        assert!(privilege.check_spawn_user("nobody", 65534).is_err());
    }

    #[test]
    fn exit_statuses_are_stable() {
        assert_eq!(PrivilegeError::UnknownUser("x".into()).exit_status(), 3);
        assert_eq!(PrivilegeError::MissingUser.exit_status(), 4);
        assert_eq!(PrivilegeError::StillRoot(0).exit_status(), 7);
    }
}
