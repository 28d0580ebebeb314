//! Profile switching logic.
//!
//! A switch is a fixed, ordered list of steps. Each step is either `Fatal`
//! (the switch stops when it fails) or `BestEffort` (a failure becomes a
//! warning in the report and the remaining steps still run). Nothing is
//! rolled back; running the same switch again converges.

use anyhow::{Result, bail};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;

use crate::fs_utils;
use crate::git::{self, Git};
use crate::paths::Paths;
use crate::platform::{self, Registry};
use crate::profiles::{AuthMethod, Profile, ValidationError};
use crate::remote;
use crate::ssh::{self, AgentStatus, IdentityStatus, SshAgent};
use crate::store::{self, Config};

/// Per-invocation switch settings
#[derive(Debug, Clone, Default)]
pub struct SwitchOptions {
    /// Report what would change without touching anything
    pub dry_run: bool,
}

/// Whether a failing step aborts the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Fatal,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PersistCurrent,
    GitIdentity,
    SshAgent,
    ClearIdentities,
    LoadIdentity,
    HostAlias,
    Credentials,
    RemoteUrl,
}

impl Step {
    pub fn kind(self) -> StepKind {
        match self {
            Step::GitIdentity => StepKind::Fatal,
            _ => StepKind::BestEffort,
        }
    }

    /// Step that must have succeeded for this one to run
    pub fn requires(self) -> Option<Step> {
        match self {
            Step::ClearIdentities | Step::LoadIdentity => Some(Step::SshAgent),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Step::PersistCurrent => "Current profile",
            Step::GitIdentity => "Git identity",
            Step::SshAgent => "SSH agent",
            Step::ClearIdentities => "Clear SSH identities",
            Step::LoadIdentity => "Load SSH identity",
            Step::HostAlias => "SSH host alias",
            Step::Credentials => "Credential store",
            Step::RemoteUrl => "Remote URL",
        }
    }

    /// Whether the step belongs to the SSH branch of a switch
    pub fn is_ssh(self) -> bool {
        matches!(
            self,
            Step::SshAgent | Step::ClearIdentities | Step::LoadIdentity | Step::HostAlias
        )
    }

    /// Steps run for a profile, in order
    pub fn plan(auth_method: AuthMethod) -> Vec<Step> {
        let mut steps = vec![Step::PersistCurrent, Step::GitIdentity];
        match auth_method {
            AuthMethod::Ssh => steps.extend([
                Step::SshAgent,
                Step::ClearIdentities,
                Step::LoadIdentity,
                Step::HostAlias,
            ]),
            AuthMethod::Https => steps.push(Step::Credentials),
        }
        steps.push(Step::RemoteUrl);
        steps
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Applied,
    Unchanged,
    Skipped,
    Warning,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    pub status: StepStatus,
    pub detail: String,
}

impl StepReport {
    fn new(step: Step, status: StepStatus, detail: impl Into<String>) -> Self {
        Self {
            step,
            status,
            detail: detail.into(),
        }
    }
}

/// What a switch did (or, for a dry run, would do)
#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub profile: String,
    /// Platform display name
    pub platform: String,
    pub auth_method: AuthMethod,
    pub dry_run: bool,
    /// Planned actions; filled for dry runs only
    pub planned: Vec<String>,
    pub steps: Vec<StepReport>,
    /// Problems found while loading the store, unrelated to the target profile
    pub load_warnings: Vec<String>,
}

impl SwitchReport {
    pub fn warnings(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Warning)
    }

    pub fn step(&self, step: Step) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }
}

/// Result of a step that did not fail outright
struct Outcome {
    status: StepStatus,
    detail: String,
}

impl Outcome {
    fn applied(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Applied,
            detail: detail.into(),
        }
    }

    fn unchanged(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Unchanged,
            detail: detail.into(),
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            detail: detail.into(),
        }
    }

    fn warning(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Warning,
            detail: detail.into(),
        }
    }
}

/// Drives a switch against the Git and SSH collaborators
pub struct Switcher<'a> {
    paths: &'a Paths,
    registry: &'a Registry,
    git: &'a dyn Git,
    agent: &'a dyn SshAgent,
}

impl<'a> Switcher<'a> {
    pub fn new(
        paths: &'a Paths,
        registry: &'a Registry,
        git: &'a dyn Git,
        agent: &'a dyn SshAgent,
    ) -> Self {
        Self {
            paths,
            registry,
            git,
            agent,
        }
    }

    /// Switch to a profile from the valid set
    ///
    /// `errors` is the load-time error map, used to explain why a stored
    /// profile cannot be selected.
    pub fn switch_to(
        &self,
        config: &mut Config,
        errors: &BTreeMap<String, ValidationError>,
        name: &str,
        options: &SwitchOptions,
    ) -> Result<SwitchReport> {
        let Some(profile) = config.profiles.get(name).cloned() else {
            if let Some(err) = errors.get(name) {
                bail!("Profile '{}' is invalid: {}", name, err);
            }
            bail!("Profile '{}' not found", name);
        };

        let mut report = SwitchReport {
            profile: name.to_string(),
            platform: self
                .registry
                .get(&profile.platform)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| profile.platform.clone()),
            auth_method: profile.auth_method,
            dry_run: options.dry_run,
            planned: Vec::new(),
            steps: Vec::new(),
            load_warnings: Vec::new(),
        };

        if options.dry_run {
            report.planned = self.plan_actions(config, name, &profile);
            return Ok(report);
        }

        let mut failed: Vec<Step> = Vec::new();
        for step in Step::plan(profile.auth_method) {
            if let Some(required) = step.requires() {
                if failed.contains(&required) {
                    failed.push(step);
                    report.steps.push(StepReport::new(
                        step,
                        StepStatus::Skipped,
                        format!("{} unavailable", required.label()),
                    ));
                    continue;
                }
            }

            debug!("Running step: {}", step);
            match self.run_step(step, config, name, &profile) {
                Ok(outcome) => {
                    if outcome.status == StepStatus::Warning {
                        warn!("{}: {}", step, outcome.detail);
                    }
                    report
                        .steps
                        .push(StepReport::new(step, outcome.status, outcome.detail));
                }
                Err(e) => match step.kind() {
                    StepKind::Fatal => {
                        return Err(e.context(format!("{} failed", step.label())));
                    }
                    StepKind::BestEffort => {
                        warn!("{} failed: {:#}", step, e);
                        failed.push(step);
                        report.steps.push(StepReport::new(
                            step,
                            StepStatus::Warning,
                            format!("{:#}", e),
                        ));
                    }
                },
            }
        }

        info!("Switched to profile '{}'", name);
        Ok(report)
    }

    fn run_step(
        &self,
        step: Step,
        config: &mut Config,
        name: &str,
        profile: &Profile,
    ) -> Result<Outcome> {
        match step {
            Step::PersistCurrent => {
                config.current = Some(name.to_string());
                store::save(self.paths, config)?;
                Ok(Outcome::applied(format!("'{}' is now current", name)))
            }
            Step::GitIdentity => {
                self.git.set_global("user.name", &profile.username)?;
                self.git.set_global("user.email", &profile.email)?;
                Ok(Outcome::applied(format!(
                    "{} <{}>",
                    profile.username, profile.email
                )))
            }
            Step::SshAgent => match self.agent.ensure_running()? {
                AgentStatus::AlreadyRunning => Ok(Outcome::unchanged("ssh-agent is running")),
                AgentStatus::Started => Ok(Outcome::applied("Started ssh-agent")),
            },
            Step::ClearIdentities => {
                self.agent.clear_identities()?;
                Ok(Outcome::applied("Cleared loaded identities"))
            }
            Step::LoadIdentity => self.load_identity(profile),
            Step::HostAlias => {
                if profile.ssh_identity.is_none() {
                    return Ok(Outcome::skipped("No SSH identity configured"));
                }
                let alias = ssh::apply_host_alias(self.paths, self.registry, name, profile)?;
                Ok(Outcome::applied(format!("Host {}", alias)))
            }
            Step::Credentials => {
                let Some(token) = config.reveal_token(profile)? else {
                    return Ok(Outcome::warning(
                        "No token configured; credential store not updated",
                    ));
                };
                let host = platform::effective_host(profile, self.registry);
                self.git.set_global("credential.helper", "store")?;
                git::write_credentials(&self.paths.git_credentials, &profile.username, &token, &host)?;
                Ok(Outcome::applied(format!("Stored token for {}", host)))
            }
            Step::RemoteUrl => self.rewrite_remote(name, profile),
        }
    }

    fn load_identity(&self, profile: &Profile) -> Result<Outcome> {
        let Some(identity) = &profile.ssh_identity else {
            return Ok(Outcome::warning("No SSH identity configured"));
        };
        let path = fs_utils::expand_tilde(identity, &self.paths.home_dir);
        match ssh::check_identity(&path) {
            IdentityStatus::MissingPrivate => Ok(Outcome::warning(format!(
                "SSH key not found: {}",
                path.display()
            ))),
            IdentityStatus::MissingPublic => Ok(Outcome::warning(format!(
                "Public key not found: {}.pub",
                path.display()
            ))),
            IdentityStatus::Ready => {
                self.agent.add_identity(&path)?;
                Ok(Outcome::applied(format!("Loaded {}", path.display())))
            }
        }
    }

    fn rewrite_remote(&self, name: &str, profile: &Profile) -> Result<Outcome> {
        if !self.git.is_inside_repo() {
            return Ok(Outcome::skipped("Not inside a Git repository"));
        }
        let Some(current) = self.git.remote_url("origin")? else {
            return Ok(Outcome::warning("No 'origin' remote to rewrite"));
        };
        let Some(target) = remote::target_url(&current, name, profile, self.registry) else {
            return Ok(Outcome::skipped(format!(
                "Unrecognized remote URL '{}'; left unchanged",
                current
            )));
        };
        if target == current {
            return Ok(Outcome::unchanged(format!("origin is {}", current)));
        }
        self.git.set_remote_url("origin", &target)?;
        Ok(Outcome::applied(format!("origin: {} -> {}", current, target)))
    }

    fn plan_actions(&self, config: &Config, name: &str, profile: &Profile) -> Vec<String> {
        let mut planned = vec![
            format!("Set Git identity to {} <{}>", profile.username, profile.email),
            format!("Use auth method {}", profile.auth_method),
        ];

        match profile.auth_method {
            AuthMethod::Ssh => match &profile.ssh_identity {
                Some(identity) => {
                    planned.push(format!("Load SSH key {}", identity));
                    planned.push(format!(
                        "Write SSH host alias {}",
                        platform::host_alias(&profile.platform, name)
                    ));
                }
                None => planned.push("No SSH key configured".to_string()),
            },
            AuthMethod::Https => {
                let host = platform::effective_host(profile, self.registry);
                if profile.has_token() && !config.no_store_tokens {
                    planned.push(format!("Store token for {} in the credential store", host));
                } else {
                    planned.push("No token configured".to_string());
                }
            }
        }

        let current = self
            .git
            .is_inside_repo()
            .then(|| self.git.remote_url("origin").ok().flatten())
            .flatten();
        match current.and_then(|url| {
            remote::target_url(&url, name, profile, self.registry).map(|target| (url, target))
        }) {
            Some((url, target)) if url != target => {
                planned.push(format!("Rewrite origin {} -> {}", url, target))
            }
            Some((url, _)) => planned.push(format!("Keep origin {}", url)),
            None => planned.push(format!(
                "Rewrite origin to use {} when inside a repository",
                profile.auth_method
            )),
        }

        planned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformDefinition;
    use crate::profiles::{ProfileFields, Secret};
    use crate::test_utils::{FakeAgent, FakeGit, setup_test_paths};
    use std::fs;
    use tempfile::TempDir;

    fn https_fields(token: &str) -> ProfileFields {
        ProfileFields {
            username: Some("octocat".to_string()),
            email: Some("a@b.com".to_string()),
            platform: Some("github".to_string()),
            auth_method: Some(AuthMethod::Https),
            token: Some(Secret::new(token)),
            ..Default::default()
        }
    }

    fn ssh_fields(platform: &str, identity: &str) -> ProfileFields {
        ProfileFields {
            username: Some("octocat".to_string()),
            email: Some("a@b.com".to_string()),
            platform: Some(platform.to_string()),
            auth_method: Some(AuthMethod::Ssh),
            ssh_identity: Some(identity.to_string()),
            ..Default::default()
        }
    }

    fn key_pair(temp_dir: &TempDir, name: &str) -> String {
        let key = temp_dir.path().join(name);
        fs::write(&key, "private").unwrap();
        fs::write(temp_dir.path().join(format!("{}.pub", name)), "public").unwrap();
        key.to_string_lossy().to_string()
    }

    #[test]
    fn test_https_switch_outside_repo() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::default();
        let agent = FakeAgent::default();

        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", https_fields("t1"), false).unwrap();
        store::save(&paths, &config).unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap();

        assert_eq!(git.global("user.name").as_deref(), Some("octocat"));
        assert_eq!(git.global("user.email").as_deref(), Some("a@b.com"));
        assert_eq!(git.global("credential.helper").as_deref(), Some("store"));

        let credentials = fs::read_to_string(&paths.git_credentials).unwrap();
        assert!(credentials.lines().any(|l| l == "https://octocat:t1@github.com"));

        assert!(report.steps.iter().all(|s| !s.step.is_ssh()));
        assert_eq!(report.warnings().count(), 0);
        assert_eq!(report.step(Step::RemoteUrl).unwrap().status, StepStatus::Skipped);
        assert!(agent.calls().is_empty());

        let reloaded = store::load(&paths).unwrap();
        assert_eq!(reloaded.config.current.as_deref(), Some("work"));
    }

    #[test]
    fn test_ssh_switch_on_custom_platform_rewrites_remote() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let mut registry = Registry::load(&paths.platforms_file);
        registry
            .register(
                &paths.platforms_file,
                "gitea",
                PlatformDefinition {
                    default_host: Some("git.x.com".to_string()),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        let git = FakeGit::in_repo("https://github.com/u/r.git");
        let agent = FakeAgent::default();

        let key = key_pair(&temp_dir, "id_p1");
        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "p1", ssh_fields("gitea", &key), false).unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "p1", &SwitchOptions::default())
            .unwrap();

        assert_eq!(git.origin().as_deref(), Some("git@gitea-p1:u/r.git"));
        assert_eq!(report.warnings().count(), 0);
        assert_eq!(
            agent.calls(),
            vec!["ensure_running".to_string(), "clear".to_string(), format!("add {}", key)]
        );

        let managed = fs::read_to_string(&paths.managed_ssh_config).unwrap();
        assert!(managed.contains("Host gitea-p1\n    HostName git.x.com\n"));
        assert!(fs::read_to_string(&paths.ssh_config).unwrap().contains("Include ~/.ssh/gitprof_config"));
    }

    #[test]
    fn test_missing_ssh_key_warns_and_continues() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::in_repo("https://github.com/u/r.git");
        let agent = FakeAgent::default();

        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", ssh_fields("github", "~/.ssh/does_not_exist"), false)
            .unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap();

        let load = report.step(Step::LoadIdentity).unwrap();
        assert_eq!(load.status, StepStatus::Warning);
        assert!(load.detail.contains("not found"));
        assert_eq!(report.step(Step::RemoteUrl).unwrap().status, StepStatus::Applied);
        assert_eq!(git.origin().as_deref(), Some("git@github-work:u/r.git"));
        assert!(!agent.calls().iter().any(|c| c.starts_with("add")));
    }

    #[test]
    fn test_remote_already_in_target_form_is_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::in_repo("git@github-work:u/r.git");
        let agent = FakeAgent::default();

        let key = key_pair(&temp_dir, "id_work");
        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", ssh_fields("github", &key), false).unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap();

        assert_eq!(report.step(Step::RemoteUrl).unwrap().status, StepStatus::Unchanged);
        assert_eq!(git.origin().as_deref(), Some("git@github-work:u/r.git"));
        assert_eq!(git.set_url_calls(), 0);
    }

    #[test]
    fn test_git_identity_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit {
            fail_identity: true,
            ..Default::default()
        };
        let agent = FakeAgent::default();

        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", https_fields("t1"), false).unwrap();

        let err = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Git identity"));
        assert!(!paths.git_credentials.exists());
    }

    #[test]
    fn test_agent_failure_skips_dependent_steps() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::default();
        let agent = FakeAgent {
            fail_start: true,
            ..Default::default()
        };

        let key = key_pair(&temp_dir, "id_work");
        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", ssh_fields("github", &key), false).unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap();

        assert_eq!(report.step(Step::SshAgent).unwrap().status, StepStatus::Warning);
        assert_eq!(report.step(Step::ClearIdentities).unwrap().status, StepStatus::Skipped);
        assert_eq!(report.step(Step::LoadIdentity).unwrap().status, StepStatus::Skipped);
        assert_eq!(report.step(Step::HostAlias).unwrap().status, StepStatus::Applied);
    }

    #[test]
    fn test_https_without_token_warns() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::default();
        let agent = FakeAgent::default();

        let mut config = store::load(&paths).unwrap().config;
        let mut fields = https_fields("");
        fields.token = None;
        store::add_or_update(&mut config, "work", fields, false).unwrap();

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(&mut config, &BTreeMap::new(), "work", &SwitchOptions::default())
            .unwrap();

        assert_eq!(report.step(Step::Credentials).unwrap().status, StepStatus::Warning);
        assert!(!paths.git_credentials.exists());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::in_repo("https://github.com/u/r.git");
        let agent = FakeAgent::default();

        let mut config = store::load(&paths).unwrap().config;
        store::add_or_update(&mut config, "work", ssh_fields("github", "~/.ssh/id_work"), false)
            .unwrap();
        config.current = None;

        let report = Switcher::new(&paths, &registry, &git, &agent)
            .switch_to(
                &mut config,
                &BTreeMap::new(),
                "work",
                &SwitchOptions { dry_run: true },
            )
            .unwrap();

        assert!(report.dry_run);
        assert!(report.steps.is_empty());
        assert!(report.planned.iter().any(|p| p.contains("octocat <a@b.com>")));
        assert!(report.planned.iter().any(|p| p.contains("~/.ssh/id_work")));
        assert!(report.planned.iter().any(|p| p.contains("git@github-work:u/r.git")));

        assert!(git.global("user.name").is_none());
        assert_eq!(git.origin().as_deref(), Some("https://github.com/u/r.git"));
        assert!(agent.calls().is_empty());
        assert!(config.current.is_none());
        assert!(!paths.managed_ssh_config.exists());
    }

    #[test]
    fn test_switch_to_invalid_profile_names_the_error() {
        let temp_dir = TempDir::new().unwrap();
        let paths = setup_test_paths(&temp_dir);
        let registry = Registry::builtin();
        let git = FakeGit::default();
        let agent = FakeAgent::default();

        let mut config = Config::default();
        let mut errors = BTreeMap::new();
        errors.insert("legacy".to_string(), ValidationError::MissingAuthMethod);

        let switcher = Switcher::new(&paths, &registry, &git, &agent);
        let err = switcher
            .switch_to(&mut config, &errors, "legacy", &SwitchOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("auth_method"));

        let err = switcher
            .switch_to(&mut config, &errors, "ghost", &SwitchOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
