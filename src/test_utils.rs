//! Test utilities shared across test modules
//!
//! Isolated paths under a temp directory plus in-memory stand-ins for the Git
//! and SSH collaborators, so switch logic can be exercised without touching the
//! real `~/.gitconfig` or ssh-agent.

use anyhow::{Result, bail};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::git::Git;
use crate::paths::Paths;
use crate::ssh::{AgentStatus, SshAgent};

/// Create a Paths struct for testing using a temporary directory as home
pub fn setup_test_paths(temp_dir: &TempDir) -> Paths {
    Paths::from_home(temp_dir.path())
}

/// Write raw config file content, creating the config directory
pub fn write_config(paths: &Paths, content: &str) {
    if let Some(parent) = paths.config_file.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&paths.config_file, content).unwrap();
}

/// In-memory [`Git`]
#[derive(Debug, Default)]
pub struct FakeGit {
    pub globals: RefCell<BTreeMap<String, String>>,
    pub inside_repo: bool,
    pub origin_url: RefCell<Option<String>>,
    /// Make `user.name` / `user.email` writes fail
    pub fail_identity: bool,
    pub set_url_count: RefCell<usize>,
}

impl FakeGit {
    /// A repository whose `origin` points at `url`
    pub fn in_repo(url: &str) -> Self {
        Self {
            inside_repo: true,
            origin_url: RefCell::new(Some(url.to_string())),
            ..Default::default()
        }
    }

    pub fn global(&self, key: &str) -> Option<String> {
        self.globals.borrow().get(key).cloned()
    }

    pub fn origin(&self) -> Option<String> {
        self.origin_url.borrow().clone()
    }

    pub fn set_url_calls(&self) -> usize {
        *self.set_url_count.borrow()
    }
}

impl Git for FakeGit {
    fn set_global(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_identity && key.starts_with("user.") {
            bail!("could not lock config file");
        }
        self.globals
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_global(&self, key: &str) -> Result<Option<String>> {
        Ok(self.global(key))
    }

    fn is_inside_repo(&self) -> bool {
        self.inside_repo
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        if remote != "origin" {
            return Ok(None);
        }
        Ok(self.origin())
    }

    fn set_remote_url(&self, remote: &str, url: &str) -> Result<()> {
        if remote != "origin" || self.origin_url.borrow().is_none() {
            bail!("No such remote '{}'", remote);
        }
        *self.origin_url.borrow_mut() = Some(url.to_string());
        *self.set_url_count.borrow_mut() += 1;
        Ok(())
    }
}

/// [`SshAgent`] that records calls
#[derive(Debug, Default)]
pub struct FakeAgent {
    pub log: RefCell<Vec<String>>,
    /// Make `ensure_running` fail
    pub fail_start: bool,
}

impl FakeAgent {
    pub fn calls(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

impl SshAgent for FakeAgent {
    fn ensure_running(&self) -> Result<AgentStatus> {
        self.log.borrow_mut().push("ensure_running".to_string());
        if self.fail_start {
            bail!("ssh-agent not available");
        }
        Ok(AgentStatus::AlreadyRunning)
    }

    fn clear_identities(&self) -> Result<()> {
        self.log.borrow_mut().push("clear".to_string());
        Ok(())
    }

    fn add_identity(&self, path: &Path) -> Result<()> {
        self.log
            .borrow_mut()
            .push(format!("add {}", path.display()));
        Ok(())
    }
}
