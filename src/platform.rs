//! Git hosting platform registry.
//!
//! Built-in platforms are compiled in. Custom platforms come from
//! `~/.gitprof/platforms.yaml`, a map of platform id to definition:
//!
//! ```yaml
//! gitea:
//!   name: Gitea
//!   defaultHost: git.example.com
//!   sshPrefix: "git@git.example.com:"
//!   httpsPrefix: https://git.example.com/
//! ```

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::fs_utils;
use crate::profiles::Profile;

/// Host used when a profile's platform is unknown and it has no override
pub const FALLBACK_HOST: &str = "github.com";

const DEFAULT_SSH_USER: &str = "git";

/// A Git hosting platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub id: String,
    pub name: String,
    pub default_host: String,
    pub ssh_prefix: String,
    pub https_prefix: String,
    pub ssh_user: String,
    pub token_auth_scope: String,
    pub custom: bool,
}

/// A platform as written in platforms.yaml; every field is optional on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_auth_scope: Option<String>,
}

fn filled(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl PlatformDefinition {
    /// Fail unless name, `defaultHost`, `sshPrefix` and `httpsPrefix` are all set
    pub fn require_fields(&self, id: &str) -> Result<()> {
        let missing: Vec<&str> = [
            ("name", &self.name),
            ("defaultHost", &self.default_host),
            ("sshPrefix", &self.ssh_prefix),
            ("httpsPrefix", &self.https_prefix),
        ]
        .into_iter()
        .filter(|(_, value)| filled(value).is_none())
        .map(|(field, _)| field)
        .collect();

        if !missing.is_empty() {
            bail!(
                "Platform '{}' is missing required fields: {}",
                id,
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Build a custom platform keyed by `id`, ignoring any id in the body
    fn into_platform(self, id: &str) -> Result<Platform> {
        self.require_fields(id)?;

        let default_host = filled(&self.default_host).unwrap_or_default().to_string();
        Ok(Platform {
            id: id.to_string(),
            name: filled(&self.name).unwrap_or_default().to_string(),
            ssh_prefix: filled(&self.ssh_prefix).unwrap_or_default().to_string(),
            https_prefix: filled(&self.https_prefix).unwrap_or_default().to_string(),
            ssh_user: filled(&self.ssh_user)
                .unwrap_or(DEFAULT_SSH_USER)
                .to_string(),
            token_auth_scope: filled(&self.token_auth_scope)
                .unwrap_or(&default_host)
                .to_string(),
            default_host,
            custom: true,
        })
    }

    /// Fill derivable fields from the host so a definition only needs `defaultHost`
    pub fn complete(mut self, id: &str) -> Self {
        let Some(host) = filled(&self.default_host).map(str::to_string) else {
            return self;
        };
        let ssh_user = filled(&self.ssh_user)
            .unwrap_or(DEFAULT_SSH_USER)
            .to_string();

        if filled(&self.name).is_none() {
            self.name = Some(id.to_string());
        }
        if filled(&self.ssh_prefix).is_none() {
            self.ssh_prefix = Some(format!("{}@{}:", ssh_user, host));
        }
        if filled(&self.https_prefix).is_none() {
            self.https_prefix = Some(format!("https://{}/", host));
        }
        if filled(&self.ssh_user).is_none() {
            self.ssh_user = Some(ssh_user);
        }
        if filled(&self.token_auth_scope).is_none() {
            self.token_auth_scope = Some(host);
        }
        self.id = None;
        self
    }
}

fn builtin(id: &str, name: &str, host: &str, ssh_prefix: &str) -> Platform {
    Platform {
        id: id.to_string(),
        name: name.to_string(),
        default_host: host.to_string(),
        ssh_prefix: ssh_prefix.to_string(),
        https_prefix: format!("https://{}/", host),
        ssh_user: DEFAULT_SSH_USER.to_string(),
        token_auth_scope: host.to_string(),
        custom: false,
    }
}

/// Known platforms: built-ins plus custom definitions
#[derive(Debug, Clone)]
pub struct Registry {
    builtins: Vec<Platform>,
    custom: BTreeMap<String, Platform>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// Registry with only the compiled-in platforms
    pub fn builtin() -> Self {
        Self {
            builtins: vec![
                builtin("github", "GitHub", "github.com", "git@github.com:"),
                builtin("gitlab", "GitLab", "gitlab.com", "git@gitlab.com:"),
                builtin("bitbucket", "Bitbucket", "bitbucket.org", "git@bitbucket.org:"),
                builtin("huggingface", "Hugging Face", "huggingface.co", "git@hf.co:"),
                builtin(
                    "azuredevops",
                    "Azure DevOps",
                    "dev.azure.com",
                    "git@ssh.dev.azure.com:v3/",
                ),
            ],
            custom: BTreeMap::new(),
        }
    }

    /// Built-ins merged with the custom definitions in `platforms_file`
    ///
    /// Never fails: an unreadable file or a broken entry is logged and skipped.
    pub fn load(platforms_file: &Path) -> Self {
        let mut registry = Self::builtin();

        let definitions = match read_definitions(platforms_file) {
            Ok(definitions) => definitions,
            Err(e) => {
                warn!("Could not load custom platforms: {:#}", e);
                return registry;
            }
        };

        for (id, definition) in definitions {
            let id = id.trim().to_ascii_lowercase();
            match definition.into_platform(&id) {
                Ok(platform) => {
                    debug!("Loaded custom platform '{}'", id);
                    registry.custom.insert(id, platform);
                }
                Err(e) => warn!("Skipping custom platform: {:#}", e),
            }
        }

        registry
    }

    /// Get the platform with the given id
    pub fn get(&self, id: &str) -> Option<&Platform> {
        self.custom
            .get(id)
            .or_else(|| self.builtins.iter().find(|p| p.id == id))
    }

    /// Get the first platform whose default host matches
    pub fn get_by_host(&self, host: &str) -> Option<&Platform> {
        self.list()
            .into_iter()
            .find(|p| p.default_host.eq_ignore_ascii_case(host))
    }

    /// All platforms, built-ins first, then custom ones sorted by id
    ///
    /// A custom platform that shadows a built-in takes the built-in's place.
    pub fn list(&self) -> Vec<&Platform> {
        let shadows_builtin = |id: &str| self.builtins.iter().any(|b| b.id == id);
        self.builtins
            .iter()
            .map(|b| self.custom.get(&b.id).unwrap_or(b))
            .chain(self.custom.values().filter(|c| !shadows_builtin(&c.id)))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Persist a custom platform definition to `platforms_file` and add it to this registry
    ///
    /// Refuses to replace an existing platform (built-in or custom) unless `force` is set.
    pub fn register(
        &mut self,
        platforms_file: &Path,
        id: &str,
        definition: PlatformDefinition,
        force: bool,
    ) -> Result<Platform> {
        let id = id.trim().to_ascii_lowercase();
        if id.is_empty() {
            bail!("Platform id cannot be empty");
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "Invalid platform id '{}'. Only alphanumeric characters, hyphens (-), and underscores (_) are allowed.",
                id
            );
        }
        if self.contains(&id) && !force {
            bail!(
                "Platform '{}' already exists. Use --force to overwrite it.",
                id
            );
        }

        let definition = definition.complete(&id);
        let platform = definition.clone().into_platform(&id)?;

        let mut definitions = if platforms_file.exists() {
            read_definitions(platforms_file)?
        } else {
            BTreeMap::new()
        };
        definitions.insert(id.clone(), definition);

        let yaml = serde_yaml::to_string(&definitions)
            .context("Failed to serialize platform definitions")?;
        fs_utils::write_atomic(platforms_file, yaml.as_bytes())?;

        self.custom.insert(id, platform.clone());
        Ok(platform)
    }
}

/// Parse a single platform definition document, as accepted by `platforms register --yaml`
///
/// `id_override` wins over an `id` in the document. All of name, `defaultHost`,
/// `sshPrefix` and `httpsPrefix` must be present.
pub fn parse_definition(
    content: &str,
    id_override: Option<&str>,
) -> Result<(String, PlatformDefinition)> {
    let definition: PlatformDefinition =
        serde_yaml::from_str(content).context("Failed to parse platform definition")?;

    let Some(id) = id_override
        .map(str::to_string)
        .or_else(|| filled(&definition.id).map(str::to_string))
    else {
        bail!("Platform id is required (in the file or as an argument)");
    };
    definition.require_fields(&id)?;
    Ok((id, definition))
}

fn read_definitions(path: &Path) -> Result<BTreeMap<String, PlatformDefinition>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read platforms file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse platforms file: {}", path.display()))
}

/// SSH host alias for a profile on a platform
pub fn host_alias(platform_id: &str, profile_name: &str) -> String {
    format!("{}-{}", platform_id, profile_name)
}

/// Host a profile talks to: its override, else its platform's default, else github.com
pub fn effective_host(profile: &Profile, registry: &Registry) -> String {
    if let Some(host) = &profile.host {
        return host.clone();
    }
    registry
        .get(&profile.platform)
        .map(|p| p.default_host.clone())
        .unwrap_or_else(|| FALLBACK_HOST.to_string())
}
