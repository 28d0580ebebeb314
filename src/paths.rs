use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the location of the config file
pub const CONFIG_FILE_ENV: &str = "GITPROF_CONFIG_FILE";

/// All computed paths used by gitprof
#[derive(Debug, Clone)]
pub struct Paths {
    /// ~
    pub home_dir: PathBuf,
    /// ~/.gitprof
    pub base_dir: PathBuf,
    /// ~/.gitprof/creds.json (or $GITPROF_CONFIG_FILE)
    pub config_file: PathBuf,
    /// ~/.gitprof/backups
    pub backups_dir: PathBuf,
    /// ~/.gitprof/platforms.yaml
    pub platforms_file: PathBuf,
    /// ~/.ssh
    pub ssh_dir: PathBuf,
    /// ~/.ssh/config
    pub ssh_config: PathBuf,
    /// ~/.ssh/gitprof_config
    pub managed_ssh_config: PathBuf,
    /// ~/.git-credentials
    pub git_credentials: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        let base_dirs = BaseDirs::new().context("Failed to determine home directory")?;
        let mut paths = Self::from_home(base_dirs.home_dir());

        if let Ok(override_path) = std::env::var(CONFIG_FILE_ENV) {
            if !override_path.trim().is_empty() {
                paths.config_file = PathBuf::from(override_path);
            }
        }

        Ok(paths)
    }

    /// Lay out every location relative to a home directory
    pub fn from_home(home: &Path) -> Self {
        let base_dir = home.join(".gitprof");
        let ssh_dir = home.join(".ssh");

        Self {
            home_dir: home.to_path_buf(),
            config_file: base_dir.join("creds.json"),
            backups_dir: base_dir.join("backups"),
            platforms_file: base_dir.join("platforms.yaml"),
            base_dir,
            ssh_config: ssh_dir.join("config"),
            managed_ssh_config: ssh_dir.join("gitprof_config"),
            ssh_dir,
            git_credentials: home.join(".git-credentials"),
        }
    }

    /// Get the backup file written when a profile is removed
    pub fn profile_backup(&self, name: &str) -> PathBuf {
        self.backups_dir.join(format!("{}.backup.json", name))
    }

    /// Render a path the way it should appear in ssh config files (`~/...` when under home)
    pub fn display_for_ssh(&self, path: &Path) -> String {
        match path.strip_prefix(&self.home_dir) {
            Ok(rest) => format!("~/{}", rest.to_string_lossy().replace('\\', "/")),
            Err(_) => path.to_string_lossy().replace('\\', "/"),
        }
    }

    /// Include directive that pulls the managed file into ~/.ssh/config
    pub fn ssh_include_line(&self) -> String {
        format!("Include {}", self.display_for_ssh(&self.managed_ssh_config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_profile_backup_path() {
        let paths = Paths::from_home(Path::new("/home/octo"));
        let backup = paths.profile_backup("work");
        assert!(backup.ends_with(".gitprof/backups/work.backup.json"));
    }

    #[test]
    fn test_ssh_include_line_uses_tilde() {
        let paths = Paths::from_home(Path::new("/home/octo"));
        assert_eq!(paths.ssh_include_line(), "Include ~/.ssh/gitprof_config");
    }

    #[test]
    fn test_display_outside_home_is_absolute() {
        let paths = Paths::from_home(Path::new("/home/octo"));
        assert_eq!(
            paths.display_for_ssh(Path::new("/etc/keys/id_ed25519")),
            "/etc/keys/id_ed25519"
        );
    }

    #[test]
    #[serial]
    fn test_config_file_env_override() {
        // SAFETY: serialized with every other test that touches the environment
        unsafe { std::env::set_var(CONFIG_FILE_ENV, "/tmp/gitprof-test/creds.json") };
        let paths = Paths::new().unwrap();
        unsafe { std::env::remove_var(CONFIG_FILE_ENV) };

        assert_eq!(paths.config_file, PathBuf::from("/tmp/gitprof-test/creds.json"));
    }
}
