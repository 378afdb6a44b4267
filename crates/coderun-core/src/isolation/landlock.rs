//! Landlock filesystem sandboxing

use landlock::{
    ABI, Access, AccessFs, Ruleset, RulesetAttr, RulesetCreated, RulesetCreatedAttr,
    path_beneath_rules,
};
use std::path::{Path, PathBuf};

use crate::{CoderunError, Result};

/// Newest ABI the rules are written against; older kernels degrade best-effort
const TARGET_ABI: ABI = ABI::V2;

/// Filesystem view granted to one child
///
/// Anything not listed is inaccessible once the ruleset is enforced.
#[derive(Debug, Clone, Default)]
pub struct LandlockConfig {
    /// Readable and executable
    pub ro_paths: Vec<PathBuf>,
    /// Fully writable
    pub rw_paths: Vec<PathBuf>,
}

impl LandlockConfig {
    #[must_use]
    pub fn ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.ro_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn rw(mut self, path: impl Into<PathBuf>) -> Self {
        self.rw_paths.push(path.into());
        self
    }

    /// Open every rule path and build the ruleset without enforcing it
    ///
    /// Paths that do not exist on this host are skipped.
    pub fn prepare(&self) -> Result<RulesetCreated> {
        let ro = existing(&self.ro_paths);
        let rw = existing(&self.rw_paths);

        tracing::debug!(ro = ro.len(), rw = rw.len(), "preparing landlock ruleset");

        Ruleset::default()
            .handle_access(AccessFs::from_all(TARGET_ABI))
            .and_then(Ruleset::create)
            .and_then(|r| r.add_rules(path_beneath_rules(&ro, AccessFs::from_read(TARGET_ABI))))
            .and_then(|r| r.add_rules(path_beneath_rules(&rw, AccessFs::from_all(TARGET_ABI))))
            .map_err(|e| CoderunError::Landlock(e.to_string()))
    }
}

fn existing(paths: &[PathBuf]) -> Vec<&Path> {
    paths
        .iter()
        .map(PathBuf::as_path)
        .filter(|p| p.exists())
        .collect()
}

/// Enforce a prepared ruleset on the calling process
pub(crate) fn restrict(ruleset: RulesetCreated) -> std::io::Result<()> {
    ruleset
        .restrict_self()
        .map(|_| ())
        .map_err(|e| std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_paths() {
        let config = LandlockConfig::default()
            .ro("/usr")
            .ro("/etc")
            .rw("/sandbox/abc");
        assert_eq!(config.ro_paths.len(), 2);
        assert_eq!(config.rw_paths, vec![PathBuf::from("/sandbox/abc")]);
    }

    #[test]
    fn missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = LandlockConfig::default()
            .ro("/definitely/not/here")
            .rw(dir.path());
        assert_eq!(existing(&config.ro_paths).len(), 0);
        assert_eq!(existing(&config.rw_paths).len(), 1);

        // Building never restricts the test process itself
        config.prepare().unwrap();
        assert!(dir.path().exists());
    }
}
