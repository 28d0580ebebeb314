//! Entry point for front ends.
//!
//! [`Manager`] owns the paths, the platform registry and the Git/SSH
//! collaborators, and exposes every operation a CLI (or any other consumer)
//! needs. Each call loads the store fresh, so the on-disk file stays the single
//! source of truth between invocations.

use anyhow::{Result, bail};
use log::warn;
use std::path::PathBuf;

use crate::doctor::{self, Diagnosis, Repository};
use crate::git::{Git, GitCli};
use crate::paths::Paths;
use crate::platform::{Platform, PlatformDefinition, Registry};
use crate::profiles::{self, AuthMethod, ProfileFields};
use crate::ssh::{self, OpenSshAgent, SshAgent};
use crate::store::{self, AddOutcome, Loaded};
use crate::switch::{SwitchOptions, SwitchReport, Switcher};

/// What a removal did
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    /// Backup file, unless skipped
    pub backup: Option<PathBuf>,
    pub warnings: Vec<String>,
}

pub struct Manager {
    paths: Paths,
    registry: Registry,
    git: Box<dyn Git>,
    agent: Box<dyn SshAgent>,
}

impl Manager {
    /// Manager driving the real `git`, `ssh-agent` and `ssh-add`
    pub fn new(paths: Paths) -> Self {
        Self::with_collaborators(paths, Box::new(GitCli::new()), Box::new(OpenSshAgent::new()))
    }

    pub fn with_collaborators(paths: Paths, git: Box<dyn Git>, agent: Box<dyn SshAgent>) -> Self {
        let registry = Registry::load(&paths.platforms_file);
        Self {
            paths,
            registry,
            git,
            agent,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Valid profiles, the current pointer and per-profile validation errors
    pub fn load_profiles(&self) -> Result<Loaded> {
        store::load(&self.paths)
    }

    /// Add or update a profile and persist it
    ///
    /// SSH profiles also get their host alias written unless `setup_ssh` is
    /// off; a failure there is returned as a warning.
    pub fn add_profile(
        &self,
        name: &str,
        fields: ProfileFields,
        overwrite: bool,
        setup_ssh: bool,
    ) -> Result<AddOutcome> {
        if let Some(platform) = &fields.platform {
            let id = profiles::normalize_platform(Some(platform));
            if !self.registry.contains(&id) {
                bail!(
                    "Unknown platform '{}'. Register it first with 'gitprof platforms register'.",
                    id
                );
            }
        }

        let loaded = store::load(&self.paths)?;
        let mut warnings = loaded.problems(Some(name));
        let mut config = loaded.config;
        let mut outcome = store::add_or_update(&mut config, name, fields, overwrite)?;
        store::save(&self.paths, &config)?;
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;

        if !setup_ssh {
            return Ok(outcome);
        }
        if let Some(profile) = config.profiles.get(name) {
            if profile.auth_method == AuthMethod::Ssh && profile.ssh_identity.is_some() {
                if let Err(e) = ssh::apply_host_alias(&self.paths, &self.registry, name, profile) {
                    warn!("Could not write SSH host alias for '{}': {:#}", name, e);
                    outcome
                        .warnings
                        .push(format!("Could not write SSH host alias: {:#}", e));
                }
            }
        }

        Ok(outcome)
    }

    /// Remove a profile and persist
    pub fn remove_profile(&self, name: &str, skip_backup: bool) -> Result<RemoveOutcome> {
        let loaded = store::load(&self.paths)?;
        let warnings = loaded.problems(Some(name));
        let mut config = loaded.config;
        let backup = store::remove(&self.paths, &mut config, name, skip_backup)?;
        store::save(&self.paths, &config)?;
        Ok(RemoveOutcome { backup, warnings })
    }

    pub fn switch_to(&self, name: &str, options: &SwitchOptions) -> Result<SwitchReport> {
        let loaded = store::load(&self.paths)?;
        let problems = loaded.problems(Some(name));
        let Loaded {
            mut config, errors, ..
        } = loaded;
        let mut report =
            Switcher::new(&self.paths, &self.registry, self.git.as_ref(), self.agent.as_ref())
                .switch_to(&mut config, &errors, name, options)?;
        report.load_warnings = problems;
        Ok(report)
    }

    /// Origin remote of the repository in the working directory, if inside one
    pub fn repository(&self) -> Option<Repository> {
        doctor::repository(self.git.as_ref())
    }

    pub fn list_platforms(&self) -> Vec<&Platform> {
        self.registry.list()
    }

    pub fn register_platform(
        &mut self,
        id: &str,
        definition: PlatformDefinition,
        force: bool,
    ) -> Result<Platform> {
        self.registry
            .register(&self.paths.platforms_file, id, definition, force)
    }

    pub fn diagnose(&self) -> Result<Diagnosis> {
        let loaded = store::load(&self.paths)?;
        Ok(doctor::diagnose(
            &self.paths,
            &loaded,
            &self.registry,
            self.git.as_ref(),
        ))
    }
}
