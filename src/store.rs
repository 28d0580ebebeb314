//! Profile store persisted at ~/.gitprof/creds.json
//!
//! Loading is partial: every stored entry is validated on its own, the ones
//! that fail are reported by name and kept aside (quarantined) so that a later
//! save writes them back exactly as they were read.

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::codec;
use crate::fs_utils;
use crate::paths::Paths;
use crate::profiles::{
    self, AuthMethod, Profile, ProfileFields, RawProfile, Secret, StoredToken, ValidationError,
    validate_profile_name,
};

/// On-disk layout of the config file
///
/// Missing and `null` fields both read as their default.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default, deserialize_with = "null_as_default")]
    current: String,
    #[serde(default, deserialize_with = "null_as_default")]
    profiles: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    store_encrypted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    no_store_tokens: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    salt: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The profile set with its token policy
#[derive(Debug, Clone)]
pub struct Config {
    /// Active profile; always names an entry of `profiles` after a load
    pub current: Option<String>,
    /// Valid profiles only
    pub profiles: BTreeMap<String, Profile>,
    pub store_encrypted: bool,
    pub no_store_tokens: bool,
    salt: String,
    quarantined: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            current: None,
            profiles: BTreeMap::new(),
            store_encrypted: true,
            no_store_tokens: false,
            salt: codec::generate_salt(),
            quarantined: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// The active profile, if any
    pub fn current_profile(&self) -> Option<(&str, &Profile)> {
        let name = self.current.as_deref()?;
        self.profiles.get(name).map(|p| (name, p))
    }

    /// Names of stored entries that failed validation
    pub fn quarantined_names(&self) -> impl Iterator<Item = &str> {
        self.quarantined.keys().map(String::as_str)
    }

    pub fn is_quarantined(&self, name: &str) -> bool {
        self.quarantined.contains_key(name)
    }

    /// Decrypt a profile's token for immediate use
    pub fn reveal_token(&self, profile: &Profile) -> Result<Option<Secret>> {
        let Some(stored) = profile.token.as_ref().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let plain = codec::decrypt(stored.as_str(), &self.salt).context("Failed to decrypt token")?;
        Ok(Some(Secret::new(plain)))
    }

    /// At-rest form of a secret under the current policy; `None` when tokens are not stored
    pub fn seal_token(&self, secret: &Secret) -> Result<Option<StoredToken>> {
        if secret.is_empty() || self.no_store_tokens {
            return Ok(None);
        }
        if self.store_encrypted {
            let sealed = codec::encrypt(secret.expose(), &self.salt)
                .context("Failed to encrypt token")?;
            Ok(Some(StoredToken::new(sealed)))
        } else {
            Ok(Some(StoredToken::new(secret.expose())))
        }
    }

    /// Re-derive a stored token for the current policy
    fn token_at_rest(&self, name: &str, profile: &Profile) -> Result<Option<StoredToken>> {
        let Some(stored) = profile.token.as_ref().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        if self.no_store_tokens {
            return Ok(None);
        }
        if self.store_encrypted == stored.is_encrypted() {
            return Ok(Some(stored.clone()));
        }
        let secret = self
            .reveal_token(profile)
            .with_context(|| format!("Profile '{}'", name))?;
        match secret {
            Some(secret) => self.seal_token(&secret),
            None => Ok(None),
        }
    }
}

/// Result of a load: the usable config plus what was wrong with the rest
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    /// Per-profile validation failures
    pub errors: BTreeMap<String, ValidationError>,
    /// Non-fatal findings (suspicious emails, a cleared current pointer)
    pub warnings: Vec<String>,
}

impl Loaded {
    /// Load warnings plus one line per invalid profile other than `except`
    pub fn problems(&self, except: Option<&str>) -> Vec<String> {
        let invalid = self
            .errors
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .map(|(name, err)| format!("Profile '{}' is invalid and was skipped: {}", name, err));
        self.warnings.iter().cloned().chain(invalid).collect()
    }
}

/// Load and validate the config file, creating an empty one if absent
pub fn load(paths: &Paths) -> Result<Loaded> {
    let path = &paths.config_file;

    if !path.exists() {
        let config = Config::default();
        save(paths, &config)?;
        info!("Created new config file: {}", path.display());
        return Ok(Loaded {
            config,
            errors: BTreeMap::new(),
            warnings: Vec::new(),
        });
    }

    if let Err(e) = fs_utils::secure_permissions(path) {
        warn!("Could not restrict permissions on {}: {:#}", path.display(), e);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let file: ConfigFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let mut config = Config {
        current: None,
        profiles: BTreeMap::new(),
        store_encrypted: file.store_encrypted,
        no_store_tokens: file.no_store_tokens,
        salt: file.salt,
        quarantined: BTreeMap::new(),
    };

    if config.salt.is_empty() {
        debug!("Config has no salt; generating one and enabling encryption");
        config.salt = codec::generate_salt();
        config.store_encrypted = true;
    }

    let mut errors = BTreeMap::new();
    let mut warnings = Vec::new();

    for (name, value) in file.profiles {
        let checked = serde_json::from_value::<RawProfile>(value.clone())
            .map_err(|e| ValidationError::Malformed(e.to_string()))
            .and_then(|raw| profiles::validate(&name, &raw, &config.salt));

        match checked {
            Ok(validated) => {
                if let Some(warning) = validated.warning {
                    warnings.push(warning);
                }
                config.profiles.insert(name, validated.profile);
            }
            Err(e) => {
                debug!("Profile '{}' is invalid: {}", name, e);
                config.quarantined.insert(name.clone(), value);
                errors.insert(name, e);
            }
        }
    }

    if !file.current.is_empty() {
        if config.profiles.contains_key(&file.current) {
            config.current = Some(file.current);
        } else {
            warnings.push(format!(
                "Current profile '{}' is missing or invalid; no profile is active",
                file.current
            ));
        }
    }

    Ok(Loaded {
        config,
        errors,
        warnings,
    })
}

/// Write the config file, applying the token policy to every valid profile
pub fn save(paths: &Paths, config: &Config) -> Result<()> {
    let path = &paths.config_file;

    let mut profiles = config.quarantined.clone();
    for (name, profile) in &config.profiles {
        let mut raw = profile.to_raw();
        raw.token = config.token_at_rest(name, profile)?;
        let value = serde_json::to_value(&raw)
            .with_context(|| format!("Failed to serialize profile '{}'", name))?;
        profiles.insert(name.clone(), value);
    }

    let file = ConfigFile {
        current: config.current.clone().unwrap_or_default(),
        profiles,
        store_encrypted: config.store_encrypted,
        no_store_tokens: config.no_store_tokens,
        salt: config.salt.clone(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_utils::create_private_dir(parent)?;
    }

    let content = serde_json::to_string_pretty(&file).context("Failed to serialize config")?;
    fs_utils::write_atomic(path, content.as_bytes())?;
    fs_utils::secure_permissions(path)?;

    debug!("Saved config to {}", path.display());
    Ok(())
}

/// What an add or update did
#[derive(Debug, Default)]
pub struct AddOutcome {
    pub created: bool,
    pub became_current: bool,
    pub warnings: Vec<String>,
}

/// Create a profile, or update one in place when `overwrite` is set
///
/// Updates merge only the fields present in `fields`.
pub fn add_or_update(
    config: &mut Config,
    name: &str,
    fields: ProfileFields,
    overwrite: bool,
) -> Result<AddOutcome> {
    validate_profile_name(name)?;

    let existing = config.profiles.get(name).cloned();
    let taken = existing.is_some() || config.is_quarantined(name);
    if taken && !overwrite {
        bail!(
            "Profile '{}' already exists. Use --overwrite to update it.",
            name
        );
    }

    let mut outcome = AddOutcome::default();
    let profile = match existing {
        Some(profile) => update_profile(config, name, profile, fields, &mut outcome)?,
        None => {
            outcome.created = true;
            create_profile(config, name, fields, &mut outcome)?
        }
    };

    if config.profiles.is_empty() && config.current.is_none() {
        config.current = Some(name.to_string());
        outcome.became_current = true;
    }

    config.quarantined.remove(name);
    config.profiles.insert(name.to_string(), profile);
    Ok(outcome)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn infer_auth_method(ssh_identity: &Option<String>) -> AuthMethod {
    if ssh_identity.is_some() {
        AuthMethod::Ssh
    } else {
        AuthMethod::Https
    }
}

fn email_warning(name: &str, email: &str) -> Option<String> {
    (!profiles::is_plausible_email(email)).then(|| {
        format!(
            "Profile '{}' has an email that does not look valid: '{}'",
            name, email
        )
    })
}

fn check_username(username: &str) -> Result<()> {
    if !profiles::is_valid_username(username) {
        bail!(
            "Invalid username '{}': use 1-39 letters, digits or hyphens, starting and ending with a letter or digit",
            username
        );
    }
    Ok(())
}

fn create_profile(
    config: &Config,
    name: &str,
    fields: ProfileFields,
    outcome: &mut AddOutcome,
) -> Result<Profile> {
    let Some(username) = non_empty(fields.username) else {
        bail!("Username is required to create profile '{}'", name);
    };
    let Some(email) = non_empty(fields.email) else {
        bail!("Email is required to create profile '{}'", name);
    };
    check_username(&username)?;
    outcome.warnings.extend(email_warning(name, &email));

    let ssh_identity = non_empty(fields.ssh_identity);
    let auth_method = fields
        .auth_method
        .unwrap_or_else(|| infer_auth_method(&ssh_identity));

    let token = match &fields.token {
        Some(secret) => config.seal_token(secret)?,
        None => None,
    };
    if fields.token.as_ref().is_some_and(|t| !t.is_empty()) && config.no_store_tokens {
        outcome
            .warnings
            .push("Token storage is disabled; the token was not saved".to_string());
    }

    Ok(Profile {
        username,
        email,
        token,
        ssh_identity,
        platform: profiles::normalize_platform(fields.platform.as_deref()),
        host: non_empty(fields.host),
        auth_method,
    })
}

fn update_profile(
    config: &Config,
    name: &str,
    mut profile: Profile,
    fields: ProfileFields,
    outcome: &mut AddOutcome,
) -> Result<Profile> {
    if let Some(username) = non_empty(fields.username) {
        check_username(&username)?;
        profile.username = username;
    }
    if let Some(email) = non_empty(fields.email) {
        outcome.warnings.extend(email_warning(name, &email));
        profile.email = email;
    }
    if let Some(platform) = fields.platform {
        profile.platform = profiles::normalize_platform(Some(&platform));
    }
    if let Some(host) = fields.host {
        profile.host = non_empty(Some(host));
    }

    let mut ssh_changed = false;
    if let Some(ssh_identity) = fields.ssh_identity {
        let ssh_identity = non_empty(Some(ssh_identity));
        ssh_changed = ssh_identity != profile.ssh_identity;
        profile.ssh_identity = ssh_identity;
    }

    let mut token_changed = false;
    if let Some(secret) = &fields.token {
        let previous = config.reveal_token(&profile).ok().flatten();
        token_changed = previous.as_ref() != Some(secret) && !(previous.is_none() && secret.is_empty());
        profile.token = config.seal_token(secret)?;
    }

    match fields.auth_method {
        Some(method) => profile.auth_method = method,
        None if ssh_changed && token_changed => outcome.warnings.push(format!(
            "Both the SSH identity and the token of '{}' changed; keeping auth method '{}'. Pass --auth-method to choose explicitly.",
            name, profile.auth_method
        )),
        None if ssh_changed => profile.auth_method = infer_auth_method(&profile.ssh_identity),
        None if token_changed => profile.auth_method = AuthMethod::Https,
        None => {}
    }

    Ok(profile)
}

/// Delete a profile (valid or quarantined), writing a backup first unless `skip_backup`
///
/// Returns the backup file path when one was written.
pub fn remove(
    paths: &Paths,
    config: &mut Config,
    name: &str,
    skip_backup: bool,
) -> Result<Option<PathBuf>> {
    let entry = match (config.profiles.get(name), config.quarantined.get(name)) {
        (Some(profile), _) => {
            let mut raw = profile.to_raw();
            if let Ok(Some(secret)) = config.reveal_token(profile) {
                raw.token = Some(StoredToken::new(secret.expose()));
            }
            serde_json::to_value(&raw).context("Failed to serialize profile")?
        }
        (None, Some(value)) => value.clone(),
        (None, None) => bail!("Profile '{}' not found", name),
    };

    let backup = if skip_backup {
        None
    } else {
        let backup_path = paths.profile_backup(name);
        let mut snapshot = BTreeMap::new();
        snapshot.insert(name.to_string(), entry);
        let content =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize backup")?;

        fs_utils::create_private_dir(&paths.backups_dir)?;
        fs_utils::write_atomic(&backup_path, content.as_bytes())?;
        fs_utils::secure_permissions(&backup_path)?;
        info!("Backed up profile '{}' to {}", name, backup_path.display());
        Some(backup_path)
    };

    config.profiles.remove(name);
    config.quarantined.remove(name);
    if config.current.as_deref() == Some(name) {
        config.current = None;
    }

    Ok(backup)
}
