//! Identity programs run under

use crate::config::Identity;
use crate::{CoderunError, Result};

/// How spawned processes obtain their identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnIdentity {
    /// The runner is already unprivileged; children keep its uid/gid
    Inherit,
    /// The runner holds root; children switch to this identity before exec
    Drop(Identity),
}

impl SpawnIdentity {
    /// Owner to give workspaces, if the runner must hand them over
    #[must_use]
    pub const fn owner(self) -> Option<Identity> {
        match self {
            Self::Inherit => None,
            Self::Drop(identity) => Some(identity),
        }
    }

    pub(crate) fn apply(self, cmd: &mut tokio::process::Command) {
        if let Self::Drop(identity) = self {
            // std drops supplementary groups when switching away from root
            cmd.uid(identity.uid).gid(identity.gid);
        }
    }
}

/// Decide how children will be confined, refusing to ever run them as root
///
/// - euid 0 with a non-root target identity: drop to it per child
/// - euid 0 without one: refused
/// - non-root: children inherit, provided no effective capability is held
pub fn resolve(target: Option<Identity>) -> Result<SpawnIdentity> {
    let euid = nix::unistd::geteuid();

    if euid.is_root() {
        return match target {
            Some(identity) if !identity.is_root() => {
                tracing::info!(uid = identity.uid, gid = identity.gid, "submissions will drop to confinement identity");
                Ok(SpawnIdentity::Drop(identity))
            }
            Some(_) => Err(CoderunError::Identity(
                "confinement identity must not be root".into(),
            )),
            None => Err(CoderunError::Identity(
                "refusing to run submissions as root: no confinement identity configured".into(),
            )),
        };
    }

    let effective = caps::read(None, caps::CapSet::Effective)
        .map_err(|e| CoderunError::Identity(format!("failed to read capabilities: {e}")))?;
    if !effective.is_empty() {
        let mut names: Vec<String> = effective.iter().map(ToString::to_string).collect();
        names.sort();
        return Err(CoderunError::Identity(format!(
            "runner holds effective capabilities: {}",
            names.join(", ")
        )));
    }

    tracing::info!(uid = euid.as_raw(), "runner is unprivileged; submissions inherit its identity");
    Ok(SpawnIdentity::Inherit)
}
