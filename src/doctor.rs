//! Diagnostic tool for gitprof.
//!
//! [`diagnose`] gathers a structured [`Diagnosis`] without printing anything
//! (it is what `doctor --json` serializes). [`render`] prints it section by
//! section:
//! - The global Git identity and credential helper.
//! - The current repository's remote.
//! - Config file permissions and token policy.
//! - Each valid profile, then the invalid ones.
//! - The SSH config integration.

use anstyle::AnsiColor;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::fs_utils;
use crate::git::Git;
use crate::paths::Paths;
use crate::platform::{self, Registry};
use crate::profiles::AuthMethod;
use crate::remote;
use crate::ssh::{self, IdentityStatus, SshSetup};
use crate::store::Loaded;
use crate::ui::Ui;

#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub name: Option<String>,
    pub email: Option<String>,
    pub credential_helper: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub origin: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionCheck {
    pub path: PathBuf,
    pub exists: bool,
    /// Octal mode, e.g. `600`
    pub mode: Option<String>,
    pub owner_only: Option<bool>,
}

impl PermissionCheck {
    fn of(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            exists: path.exists(),
            mode: fs_utils::mode_string(path),
            owner_only: fs_utils::is_owner_only(path),
        }
    }

    pub fn too_open(&self) -> bool {
        self.owner_only == Some(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPolicy {
    pub store_encrypted: bool,
    pub no_store_tokens: bool,
}

impl TokenPolicy {
    pub fn stores_plaintext(&self) -> bool {
        !self.store_encrypted && !self.no_store_tokens
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileCheck {
    pub name: String,
    pub username: String,
    pub email: String,
    pub platform: String,
    pub platform_known: bool,
    pub effective_host: String,
    pub explicit_host: bool,
    pub auth_method: AuthMethod,
    pub has_token: bool,
    pub ssh_identity: Option<String>,
    pub identity_status: Option<IdentityStatus>,
    /// Whether the managed SSH file has this profile's alias
    pub host_alias_configured: Option<bool>,
    /// Other profiles on the same platform with the same explicit host
    pub host_conflicts: Vec<String>,
}

impl ProfileCheck {
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.platform_known {
            issues.push(format!("Unknown platform '{}'", self.platform));
        }
        for other in &self.host_conflicts {
            issues.push(format!("Duplicate host with profile '{}'", other));
        }
        match self.auth_method {
            AuthMethod::Https if !self.has_token => {
                issues.push("HTTPS profile has no token configured".to_string())
            }
            AuthMethod::Ssh => match (&self.ssh_identity, self.identity_status) {
                (None, _) => issues.push("SSH profile has no identity configured".to_string()),
                (Some(path), Some(IdentityStatus::MissingPrivate)) => {
                    issues.push(format!("SSH key not found: {}", path))
                }
                (Some(path), Some(IdentityStatus::MissingPublic)) => {
                    issues.push(format!("Public key not found: {}.pub", path))
                }
                _ => {}
            },
            _ => {}
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidProfile {
    pub name: String,
    pub error: String,
}

/// Everything `doctor` reports
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub identity: Identity,
    /// `None` outside a repository
    pub repository: Option<Repository>,
    pub config_file: PathBuf,
    pub permissions: Vec<PermissionCheck>,
    pub token_policy: TokenPolicy,
    pub current: Option<String>,
    pub profiles: Vec<ProfileCheck>,
    pub invalid_profiles: Vec<InvalidProfile>,
    pub ssh: SshSetup,
    /// Load-time warnings
    pub warnings: Vec<String>,
}

impl Diagnosis {
    /// Count of findings that need attention
    pub fn issue_count(&self) -> usize {
        let needs_ssh = self
            .profiles
            .iter()
            .any(|p| p.auth_method == AuthMethod::Ssh);
        self.profiles.iter().map(|p| p.issues().len()).sum::<usize>()
            + self.invalid_profiles.len()
            + self.permissions.iter().filter(|p| p.too_open()).count()
            + usize::from(self.token_policy.stores_plaintext())
            + usize::from(needs_ssh && !self.ssh.is_ready())
    }
}

/// Origin remote and its protocol; `None` outside a repository
pub fn repository(git: &dyn Git) -> Option<Repository> {
    git.is_inside_repo().then(|| {
        let origin = git.remote_url("origin").ok().flatten();
        Repository {
            protocol: origin
                .as_deref()
                .map(|url| remote::protocol_of(url).to_string()),
            origin,
        }
    })
}

/// Gather diagnostics from the loaded store and the environment
pub fn diagnose(paths: &Paths, loaded: &Loaded, registry: &Registry, git: &dyn Git) -> Diagnosis {
    let config = &loaded.config;

    let identity = Identity {
        name: git.get_global("user.name").ok().flatten(),
        email: git.get_global("user.email").ok().flatten(),
        credential_helper: git.get_global("credential.helper").ok().flatten(),
    };

    let repository = repository(git);

    let profiles = config
        .profiles
        .iter()
        .map(|(name, profile)| {
            let host_conflicts = match &profile.host {
                Some(host) => config
                    .profiles
                    .iter()
                    .filter(|(other, p)| {
                        *other != name
                            && p.platform == profile.platform
                            && p.host.as_deref() == Some(host.as_str())
                    })
                    .map(|(other, _)| other.clone())
                    .collect(),
                None => Vec::new(),
            };

            let identity_status = profile.ssh_identity.as_ref().map(|identity| {
                ssh::check_identity(&fs_utils::expand_tilde(identity, &paths.home_dir))
            });
            let host_alias_configured = (profile.auth_method == AuthMethod::Ssh
                && profile.ssh_identity.is_some())
            .then(|| ssh::has_host_block(paths, &platform::host_alias(&profile.platform, name)));

            ProfileCheck {
                name: name.clone(),
                username: profile.username.clone(),
                email: profile.email.clone(),
                platform: profile.platform.clone(),
                platform_known: registry.contains(&profile.platform),
                effective_host: platform::effective_host(profile, registry),
                explicit_host: profile.host.is_some(),
                auth_method: profile.auth_method,
                has_token: profile.has_token(),
                ssh_identity: profile.ssh_identity.clone(),
                identity_status,
                host_alias_configured,
                host_conflicts,
            }
        })
        .collect();

    let invalid_profiles = loaded
        .errors
        .iter()
        .map(|(name, err)| InvalidProfile {
            name: name.clone(),
            error: err.to_string(),
        })
        .collect();

    Diagnosis {
        identity,
        repository,
        config_file: paths.config_file.clone(),
        permissions: vec![
            PermissionCheck::of(&paths.config_file),
            PermissionCheck::of(&paths.managed_ssh_config),
            PermissionCheck::of(&paths.git_credentials),
        ],
        token_policy: TokenPolicy {
            store_encrypted: config.store_encrypted,
            no_store_tokens: config.no_store_tokens,
        },
        current: config.current.clone(),
        profiles,
        invalid_profiles,
        ssh: ssh::check_setup(paths),
        warnings: loaded.warnings.clone(),
    }
}

fn value_or_unset(ui: &Ui, value: &Option<String>) -> String {
    match value {
        Some(v) => v.clone(),
        None => ui.dim("(not set)"),
    }
}

/// Print a diagnosis
pub fn render(diagnosis: &Diagnosis, ui: &Ui) {
    ui.section("gitprof Doctor");
    ui.newline();

    check_step(ui, "Git Identity", || {
        let id = &diagnosis.identity;
        ui.println(format!("  {} user.name: {}", ui.icon_info(), value_or_unset(ui, &id.name)));
        ui.println(format!("  {} user.email: {}", ui.icon_info(), value_or_unset(ui, &id.email)));
        ui.println(format!(
            "  {} credential.helper: {}",
            ui.icon_info(),
            value_or_unset(ui, &id.credential_helper)
        ));
        if id.name.is_none() || id.email.is_none() {
            ui.println(format!(
                "  {} Global identity incomplete. Run 'gitprof switch <profile>'",
                ui.icon_warn()
            ));
        }
        true
    });

    check_step(ui, "Repository", || {
        match &diagnosis.repository {
            None => ui.println(format!("  {} Not inside a Git repository", ui.icon_info())),
            Some(repo) => {
                ui.println(format!(
                    "  {} origin: {}",
                    ui.icon_info(),
                    value_or_unset(ui, &repo.origin)
                ));
                ui.println(format!(
                    "  {} protocol: {}",
                    ui.icon_info(),
                    value_or_unset(ui, &repo.protocol)
                ));
            }
        }
        true
    });

    check_step(ui, "Configuration", || {
        let mut ok = true;
        ui.println(format!(
            "  {} Config file: {}",
            ui.icon_info(),
            diagnosis.config_file.display()
        ));
        for check in diagnosis.permissions.iter().filter(|c| c.exists) {
            let mode = check.mode.as_deref().unwrap_or("?");
            if check.too_open() {
                ok = false;
                ui.println(format!(
                    "  {} {} permissions are too open ({}). Run 'chmod 600 {}'",
                    ui.icon_err(),
                    check.path.display(),
                    mode,
                    check.path.display()
                ));
            } else {
                ui.println(format!(
                    "  {} {} ({})",
                    ui.icon_ok(),
                    check.path.display(),
                    mode
                ));
            }
        }

        let policy = &diagnosis.token_policy;
        if policy.no_store_tokens {
            ui.println(format!("  {} Tokens are not stored", ui.icon_ok()));
        } else if policy.store_encrypted {
            ui.println(format!("  {} Tokens are encrypted at rest", ui.icon_ok()));
        } else {
            ok = false;
            ui.println(format!("  {} Tokens are stored in plaintext", ui.icon_warn()));
        }

        for warning in &diagnosis.warnings {
            ui.println(format!("  {} {}", ui.icon_warn(), warning));
        }
        ok
    });

    check_step(ui, "Profiles", || {
        if diagnosis.profiles.is_empty() {
            if diagnosis.invalid_profiles.is_empty() {
                ui.println(format!(
                    "  {} No profiles configured. Run 'gitprof add <name> --username <user> --email <email>'",
                    ui.icon_warn()
                ));
            } else {
                ui.println(format!("  {} No valid profiles", ui.icon_warn()));
            }
            return true;
        }

        ui.println(format!(
            "  Current: {}",
            diagnosis.current.as_deref().unwrap_or("(none)")
        ));
        let mut all_ok = true;
        for check in &diagnosis.profiles {
            let issues = check.issues();
            let host_note = if check.explicit_host { "" } else { " (default)" };
            let line = format!(
                "{} [{} via {}, host {}{}]",
                check.name, check.platform, check.auth_method, check.effective_host, host_note
            );
            if issues.is_empty() {
                ui.println(format!("    {} {}", ui.icon_ok(), line));
            } else {
                all_ok = false;
                ui.println(format!("    {} {}", ui.icon_warn(), line));
                for issue in issues {
                    ui.println(format!("        {}", issue));
                }
            }
            if check.host_alias_configured == Some(false) {
                ui.println(format!(
                    "        {}",
                    ui.dim("SSH host alias not written yet; it is created on switch")
                ));
            }
        }
        all_ok
    });

    if !diagnosis.invalid_profiles.is_empty() {
        check_step(ui, "Invalid Profiles", || {
            for invalid in &diagnosis.invalid_profiles {
                ui.println(format!("    {} {}: {}", ui.icon_err(), invalid.name, invalid.error));
            }
            ui.println(format!(
                "  {} These profiles cannot be used until fixed. Re-add them with --overwrite or remove them.",
                ui.icon_info()
            ));
            false
        });
    }

    check_step(ui, "SSH Configuration", || {
        let ssh = &diagnosis.ssh;
        if !ssh.config_exists {
            ui.println(format!("  {} ~/.ssh/config not found", ui.icon_warn()));
        } else if ssh.include_present {
            ui.println(format!("  {} Include line present", ui.icon_ok()));
        } else {
            ui.println(format!(
                "  {} ~/.ssh/config does not include the managed file",
                ui.icon_warn()
            ));
        }
        if ssh.managed_exists {
            ui.println(format!("  {} Managed SSH config present", ui.icon_ok()));
        } else {
            ui.println(format!(
                "  {} Managed SSH config not created yet (written when an SSH profile is added or switched to)",
                ui.icon_info()
            ));
        }
        ssh.is_ready()
            || !diagnosis
                .profiles
                .iter()
                .any(|p| p.auth_method == AuthMethod::Ssh)
    });

    ui.section("Summary");
    match diagnosis.issue_count() {
        0 => ui.ok("No issues found"),
        n => ui.warn(format!("{} issue(s) found", n)),
    }
}

fn check_step<F>(ui: &Ui, name: &str, check_fn: F)
where
    F: FnOnce() -> bool,
{
    ui.println(ui.bold(format!("Checking {}...", name)));
    let success = check_fn();
    if !success {
        ui.println(ui.colored("  Issues detected!", AnsiColor::Red));
    }
    ui.newline();
}
