use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathsError {
    #[error("HOME environment variable is not set")]
    MissingHome,

    #[error("failed to prepare config dir '{path}': {source}")]
    ConfigDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-user file layout for the daemon.
///
/// Everything lives under `$XDG_CONFIG_HOME/companion` (default
/// `~/.config/companion`): the config file, pid file, data stores, and
/// extracted skill bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionPaths {
    home_dir: PathBuf,
    config_root: PathBuf,
}

impl CompanionPaths {
    pub fn from_env() -> Result<Self, PathsError> {
        let home = std::env::var("HOME").map_err(|_| PathsError::MissingHome)?;
        let xdg_config_home = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Ok(Self::from_home_and_xdg(PathBuf::from(home), xdg_config_home))
    }

    pub fn from_home_and_xdg(home_dir: PathBuf, xdg_config_home: Option<PathBuf>) -> Self {
        let config_base = xdg_config_home.unwrap_or_else(|| home_dir.join(".config"));
        let config_root = config_base.join("companion");
        Self {
            home_dir,
            config_root,
        }
    }

    /// Layout rooted at an explicit directory (`--config-dir`).
    pub fn with_config_root(home_dir: PathBuf, config_root: PathBuf) -> Self {
        Self {
            home_dir,
            config_root,
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_root.join("companion.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.config_root.join("companion.pid")
    }

    pub fn runs_file(&self) -> PathBuf {
        self.config_root.join("runs.json")
    }

    pub fn approvals_file(&self) -> PathBuf {
        self.config_root.join("approvals.json")
    }

    pub fn cron_file(&self) -> PathBuf {
        self.config_root.join("cron-jobs.json")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.config_root.join("skills")
    }

    /// Create the config dir with owner-only permissions.
    pub fn ensure_config_root(&self) -> Result<(), PathsError> {
        fs::create_dir_all(&self.config_root).map_err(|source| PathsError::ConfigDir {
            path: self.config_root.clone(),
            source,
        })?;
        set_owner_only_dir(&self.config_root).map_err(|source| PathsError::ConfigDir {
            path: self.config_root.clone(),
            source,
        })
    }
}

/// Restrict a directory to the owner (0700). Best effort off POSIX.
pub fn set_owner_only_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Restrict a file to owner read/write (0600). Best effort off POSIX.
pub fn set_owner_only_file(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_paths_are_stable() {
        let paths = CompanionPaths::from_home_and_xdg(PathBuf::from("/tmp/home"), None);
        assert_eq!(
            paths.config_root(),
            Path::new("/tmp/home/.config/companion")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/tmp/home/.config/companion/companion.json")
        );
        assert_eq!(
            paths.cron_file(),
            PathBuf::from("/tmp/home/.config/companion/cron-jobs.json")
        );
    }

    #[test]
    fn xdg_config_home_overrides_default_root() {
        let paths = CompanionPaths::from_home_and_xdg(
            PathBuf::from("/home/user"),
            Some(PathBuf::from("/xdg/config")),
        );
        assert_eq!(paths.config_root(), Path::new("/xdg/config/companion"));
        assert_eq!(paths.home_dir(), Path::new("/home/user"));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_config_root_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = CompanionPaths::with_config_root(
            PathBuf::from("/tmp/home"),
            tmp.path().join("companion"),
        );
        paths.ensure_config_root().expect("ensure");
        let mode = fs::metadata(paths.config_root())
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
