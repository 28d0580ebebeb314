//! SSH collaborator: the ssh-agent, identity files and host-alias config.
//!
//! Host aliases live in a managed file (`~/.ssh/gitprof_config`) that the
//! user's `~/.ssh/config` pulls in with an `Include` line. Each alias gets one
//! block:
//!
//! ```text
//! # Profile: work on GitHub (managed by gitprof)
//! Host github-work
//!     HostName github.com
//!     User git
//!     IdentityFile ~/.ssh/id_work
//!     IdentitiesOnly yes
//! ```

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::Serialize;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::fs_utils;
use crate::paths::Paths;
use crate::platform::{self, Registry};
use crate::profiles::Profile;

const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";
const INCLUDE_COMMENT: &str = "# Added by gitprof";

/// How the agent became reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    AlreadyRunning,
    Started,
}

/// Operations the switch needs from an SSH agent
pub trait SshAgent {
    /// Make sure an agent is reachable, starting one when needed
    fn ensure_running(&self) -> Result<AgentStatus>;
    /// Remove every identity loaded in the agent
    fn clear_identities(&self) -> Result<()>;
    /// Load one private key into the agent
    fn add_identity(&self, path: &Path) -> Result<()>;
}

/// [`SshAgent`] backed by `ssh-agent` / `ssh-add`
///
/// When this type starts an agent it remembers the socket and hands it to
/// later `ssh-add` runs through the child environment.
#[derive(Debug, Default)]
pub struct OpenSshAgent {
    auth_sock: RefCell<Option<String>>,
}

impl OpenSshAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn ssh_add(&self, args: &[&str]) -> Result<Output> {
        let mut command = Command::new("ssh-add");
        command.args(args);
        if let Some(sock) = self.auth_sock.borrow().as_deref() {
            command.env(AUTH_SOCK_ENV, sock);
        }
        debug!("Running ssh-add {}", args.join(" "));
        command
            .output()
            .with_context(|| format!("Failed to run ssh-add {}", args.join(" ")))
    }

    fn agent_reachable(&self) -> bool {
        let has_socket =
            self.auth_sock.borrow().is_some() || std::env::var_os(AUTH_SOCK_ENV).is_some();
        if !has_socket {
            return false;
        }
        // ssh-add -l exits 1 for an empty agent and 2 when it cannot connect
        self.ssh_add(&["-l"])
            .map(|output| matches!(output.status.code(), Some(0) | Some(1)))
            .unwrap_or(false)
    }
}

/// Extract `SSH_AUTH_SOCK` from `ssh-agent -s` output
pub fn parse_agent_socket(output: &str) -> Option<String> {
    output
        .split([';', '\n'])
        .map(str::trim)
        .find_map(|part| part.strip_prefix("SSH_AUTH_SOCK="))
        .map(str::to_string)
        .filter(|sock| !sock.is_empty())
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

impl SshAgent for OpenSshAgent {
    fn ensure_running(&self) -> Result<AgentStatus> {
        if self.agent_reachable() {
            return Ok(AgentStatus::AlreadyRunning);
        }

        let output = Command::new("ssh-agent")
            .arg("-s")
            .output()
            .context("Failed to run ssh-agent")?;
        if !output.status.success() {
            bail!("ssh-agent failed to start: {}", combined_output(&output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let sock = parse_agent_socket(&stdout)
            .context("Could not find SSH_AUTH_SOCK in ssh-agent output")?;
        info!("Started ssh-agent at {}", sock);
        *self.auth_sock.borrow_mut() = Some(sock);
        Ok(AgentStatus::Started)
    }

    fn clear_identities(&self) -> Result<()> {
        let output = self.ssh_add(&["-D"])?;
        if output.status.success() {
            return Ok(());
        }
        let text = combined_output(&output);
        if text.contains("Agent has no identities") || text.contains("Could not remove all identities") {
            debug!("ssh-agent had no identities to clear");
            return Ok(());
        }
        bail!("Failed to clear ssh-agent identities: {}", text)
    }

    fn add_identity(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let output = self.ssh_add(&[path_str.as_ref()])?;
        if !output.status.success() {
            bail!(
                "Failed to add SSH identity '{}': {}",
                path.display(),
                combined_output(&output)
            );
        }
        Ok(())
    }
}

/// Whether a key pair is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Ready,
    MissingPrivate,
    MissingPublic,
}

/// Check that both the private key and its `.pub` companion exist
pub fn check_identity(path: &Path) -> IdentityStatus {
    if !path.is_file() {
        return IdentityStatus::MissingPrivate;
    }
    let mut public = path.as_os_str().to_os_string();
    public.push(".pub");
    if !PathBuf::from(public).is_file() {
        return IdentityStatus::MissingPublic;
    }
    IdentityStatus::Ready
}

/// State of the SSH config integration
#[derive(Debug, Clone, Serialize)]
pub struct SshSetup {
    pub config_exists: bool,
    pub include_present: bool,
    pub managed_exists: bool,
}

impl SshSetup {
    pub fn is_ready(&self) -> bool {
        self.config_exists && self.include_present && self.managed_exists
    }
}

fn has_include(content: &str, include_line: &str) -> bool {
    content.lines().any(|line| line.trim() == include_line)
}

pub fn check_setup(paths: &Paths) -> SshSetup {
    let content = fs::read_to_string(&paths.ssh_config).ok();
    SshSetup {
        config_exists: content.is_some(),
        include_present: content
            .as_deref()
            .is_some_and(|c| has_include(c, &paths.ssh_include_line())),
        managed_exists: paths.managed_ssh_config.is_file(),
    }
}

/// Make `~/.ssh/config` include the managed file; returns whether it changed
pub fn ensure_include(paths: &Paths) -> Result<bool> {
    fs_utils::create_private_dir(&paths.ssh_dir)?;

    let content = if paths.ssh_config.exists() {
        fs::read_to_string(&paths.ssh_config)
            .with_context(|| format!("Failed to read SSH config: {}", paths.ssh_config.display()))?
    } else {
        String::new()
    };

    let include_line = paths.ssh_include_line();
    if has_include(&content, &include_line) {
        return Ok(false);
    }

    // Include must come before any Host block or it only applies inside that block
    let mut updated = format!("{}\n{}\n", INCLUDE_COMMENT, include_line);
    if !content.trim().is_empty() {
        updated.push('\n');
        updated.push_str(&content);
        if !updated.ends_with('\n') {
            updated.push('\n');
        }
    }

    fs_utils::write_atomic(&paths.ssh_config, updated.as_bytes())?;
    info!("Added include for managed SSH config to {}", paths.ssh_config.display());
    Ok(true)
}

/// Render one host block
pub fn host_block(
    profile_name: &str,
    platform_name: &str,
    alias: &str,
    host_name: &str,
    user: &str,
    identity_file: &str,
) -> String {
    format!(
        "# Profile: {} on {} (managed by gitprof)\n\
         Host {}\n    \
         HostName {}\n    \
         User {}\n    \
         IdentityFile {}\n    \
         IdentitiesOnly yes\n",
        profile_name, platform_name, alias, host_name, user, identity_file
    )
}

fn is_block_body(line: &str) -> bool {
    !line.trim().is_empty() && line.starts_with(char::is_whitespace)
}

/// Insert or replace the block for `alias` in managed-config content
///
/// The first existing block is replaced in place; any later duplicates are dropped.
pub fn upsert_host_block(content: &str, alias: &str, block: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let host_line = format!("Host {}", alias);
    let is_host = |idx: usize| lines.get(idx).is_some_and(|line| line.trim() == host_line);

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 6);
    let mut replaced = false;
    let mut i = 0;
    while i < lines.len() {
        let profile_comment = lines[i].trim_start().starts_with("# Profile:") && is_host(i + 1);
        if !profile_comment && !is_host(i) {
            out.push(lines[i]);
            i += 1;
            continue;
        }

        let mut end = if profile_comment { i + 2 } else { i + 1 };
        while end < lines.len() && is_block_body(lines[end]) {
            end += 1;
        }
        if replaced {
            if out.last().is_some_and(|line| line.trim().is_empty()) {
                out.pop();
            }
        } else {
            out.extend(block.lines());
            replaced = true;
        }
        i = end;
    }

    if !replaced {
        while out.last().is_some_and(|line| line.trim().is_empty()) {
            out.pop();
        }
        if !out.is_empty() {
            out.push("");
        }
        out.extend(block.lines());
    }

    let mut result = out.join("\n");
    result.push('\n');
    result
}

/// Whether the managed file has a block for `alias`
pub fn has_host_block(paths: &Paths, alias: &str) -> bool {
    let host_line = format!("Host {}", alias);
    fs::read_to_string(&paths.managed_ssh_config)
        .map(|content| content.lines().any(|line| line.trim() == host_line))
        .unwrap_or(false)
}

/// Write the host alias block for a profile with an SSH identity; returns the alias
pub fn apply_host_alias(
    paths: &Paths,
    registry: &Registry,
    profile_name: &str,
    profile: &Profile,
) -> Result<String> {
    let Some(identity) = &profile.ssh_identity else {
        bail!("Profile '{}' has no SSH identity", profile_name);
    };

    let alias = platform::host_alias(&profile.platform, profile_name);
    let (platform_name, user) = match registry.get(&profile.platform) {
        Some(p) => (p.name.clone(), p.ssh_user.clone()),
        None => (profile.platform.clone(), "git".to_string()),
    };
    let host_name = platform::effective_host(profile, registry);
    let identity_path = fs_utils::expand_tilde(identity, &paths.home_dir);
    let block = host_block(
        profile_name,
        &platform_name,
        &alias,
        &host_name,
        &user,
        &paths.display_for_ssh(&identity_path),
    );

    ensure_include(paths)?;

    let managed = &paths.managed_ssh_config;
    let content = if managed.exists() {
        fs::read_to_string(managed)
            .with_context(|| format!("Failed to read {}", managed.display()))?
    } else {
        String::new()
    };
    let updated = upsert_host_block(&content, &alias, &block);
    if updated != content {
        fs_utils::write_atomic(managed, updated.as_bytes())?;
        info!("Updated SSH host alias '{}'", alias);
    }

    Ok(alias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::AuthMethod;
    use crate::test_utils::setup_test_paths;
    use tempfile::TempDir;

    fn ssh_profile(identity: &str) -> Profile {
        Profile {
            username: "octocat".to_string(),
            email: "a@b.com".to_string(),
            token: None,
            ssh_identity: Some(identity.to_string()),
            platform: "github".to_string(),
            host: None,
            auth_method: AuthMethod::Ssh,
        }
    }

    #[test]
    fn test_parse_agent_socket() {
        let output = "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.123; export SSH_AUTH_SOCK;\nSSH_AGENT_PID=124; export SSH_AGENT_PID;\necho Agent pid 124;\n";
        assert_eq!(
            parse_agent_socket(output).as_deref(),
            Some("/tmp/ssh-abc/agent.123")
        );
        assert_eq!(parse_agent_socket("echo nothing;"), None);
    }

    #[test]
    fn test_check_identity() {
        let temp_dir = TempDir::new().unwrap();
        let key = temp_dir.path().join("id_work");

        assert_eq!(check_identity(&key), IdentityStatus::MissingPrivate);
        fs::write(&key, "private").unwrap();
        assert_eq!(check_identity(&key), IdentityStatus::MissingPublic);
        fs::write(temp_dir.path().join("id_work.pub"), "public").unwrap();
        assert_eq!(check_identity(&key), IdentityStatus::Ready);
    }

    #[test]
    fn test_upsert_appends_then_replaces_in_place() {
        let first = host_block("work", "GitHub", "github-work", "github.com", "git", "~/.ssh/a");
        let other = host_block("home", "GitHub", "github-home", "github.com", "git", "~/.ssh/b");
        let second = host_block("work", "GitHub", "github-work", "github.com", "git", "~/.ssh/c");

        let content = upsert_host_block("", "github-work", &first);
        assert_eq!(content, first);

        let content = upsert_host_block(&content, "github-home", &other);
        let content = upsert_host_block(&content, "github-work", &second);

        assert_eq!(content.matches("Host github-work").count(), 1);
        assert!(content.contains("IdentityFile ~/.ssh/c"));
        assert!(!content.contains("IdentityFile ~/.ssh/a"));
        let work_pos = content.find("Host github-work").unwrap();
        let home_pos = content.find("Host github-home").unwrap();
        assert!(work_pos < home_pos);
    }

    #[test]
    fn test_upsert_collapses_duplicate_blocks() {
        let old = host_block("work", "GitHub", "github-work", "github.com", "git", "~/.ssh/a");
        let other = host_block("home", "GitHub", "github-home", "github.com", "git", "~/.ssh/b");
        let content = format!("{}\n{}\n{}", old, other, old);
        let new = host_block("work", "GitHub", "github-work", "github.com", "git", "~/.ssh/c");

        let updated = upsert_host_block(&content, "github-work", &new);
        assert_eq!(updated.matches("Host github-work").count(), 1);
        assert_eq!(updated.matches("# Profile: work").count(), 1);
        assert!(!updated.contains("~/.ssh/a"));
        assert!(updated.contains("Host github-home"));
        assert!(updated.starts_with(&new));
        assert!(!updated.contains("\n\n\n"));
        assert!(updated.ends_with("IdentitiesOnly yes\n"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let block = host_block("work", "GitHub", "github-work", "github.com", "git", "~/.ssh/a");
        let once = upsert_host_block("Host legacy\n    HostName x\n", "github-work", &block);
        let twice = upsert_host_block(&once, "github-work", &block);
        assert_eq!(once, twice);
        assert!(once.starts_with("Host legacy\n    HostName x\n\n# Profile: work"));
    }

    #[test]
    fn test_ensure_include_prepends_once() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        fs::create_dir_all(&paths.ssh_dir).unwrap();
        fs::write(&paths.ssh_config, "Host *\n    AddKeysToAgent yes\n").unwrap();

        assert!(ensure_include(&paths).unwrap());
        assert!(!ensure_include(&paths).unwrap());

        let content = fs::read_to_string(&paths.ssh_config).unwrap();
        assert!(content.starts_with("# Added by gitprof\nInclude ~/.ssh/gitprof_config\n"));
        assert!(content.ends_with("Host *\n    AddKeysToAgent yes\n"));
        assert_eq!(content.matches("Include").count(), 1);
    }

    #[test]
    fn test_apply_host_alias() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();

        let alias = apply_host_alias(&paths, &registry, "work", &ssh_profile("~/.ssh/id_work")).unwrap();
        assert_eq!(alias, "github-work");
        apply_host_alias(&paths, &registry, "work", &ssh_profile("~/.ssh/id_work")).unwrap();

        let managed = fs::read_to_string(&paths.managed_ssh_config).unwrap();
        assert_eq!(
            managed,
            "# Profile: work on GitHub (managed by gitprof)\n\
             Host github-work\n    \
             HostName github.com\n    \
             User git\n    \
             IdentityFile ~/.ssh/id_work\n    \
             IdentitiesOnly yes\n"
        );
        assert!(has_host_block(&paths, "github-work"));
        assert!(check_setup(&paths).is_ready());

        #[cfg(unix)]
        assert_eq!(
            fs_utils::mode_string(&paths.managed_ssh_config).as_deref(),
            Some("600")
        );
    }

    #[test]
    fn test_apply_host_alias_requires_identity() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let mut profile = ssh_profile("~/.ssh/id_work");
        profile.ssh_identity = None;
        assert!(apply_host_alias(&paths, &Registry::builtin(), "work", &profile).is_err());
        assert!(!check_setup(&paths).config_exists);
    }
}
