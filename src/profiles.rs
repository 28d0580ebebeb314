//! Profile data model and per-entry validation.
//!
//! A profile exists in two shapes:
//! - [`RawProfile`] is what the config file holds, loosely typed so that a
//!   broken entry can still be read (and written back untouched).
//! - [`Profile`] is the validated form the rest of the crate works with.
//!
//! [`validate`] turns one into the other. It is a pure function so the store
//! can run it independently for every entry and collect failures by name.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use validator::ValidateEmail;
use zeroize::ZeroizeOnDrop;

use crate::codec::{self, CodecError};

/// Platform used when a profile does not name one
pub const DEFAULT_PLATFORM: &str = "github";

/// Longest username accepted by the hosting platforms
const MAX_USERNAME_LENGTH: usize = 39;

/// Characters that are rejected with a dedicated message because they are
/// meaningful to a shell
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '>', '<', '`', '$', '\\', '"', '\'', ' '];

/// Protocol a profile uses to talk to its remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Ssh,
    Https,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Ssh => "ssh",
            AuthMethod::Https => "https",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(AuthMethod::Ssh),
            "https" => Ok(AuthMethod::Https),
            other => Err(format!(
                "invalid auth method '{}' (expected 'ssh' or 'https')",
                other
            )),
        }
    }
}

/// Token as it sits in the config file: `enc:` ciphertext or plaintext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredToken(String);

impl StoredToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_encrypted(&self) -> bool {
        codec::is_encrypted(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decrypted token, wiped from memory when dropped
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// A profile entry exactly as the config file stores it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProfile {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<StoredToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
}

/// A profile that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
    pub email: String,
    pub token: Option<StoredToken>,
    pub ssh_identity: Option<String>,
    /// Lowercase platform id
    pub platform: String,
    pub host: Option<String>,
    pub auth_method: AuthMethod,
}

impl Profile {
    pub fn to_raw(&self) -> RawProfile {
        RawProfile {
            username: self.username.clone(),
            email: self.email.clone(),
            token: self.token.clone(),
            ssh_identity: self.ssh_identity.clone(),
            platform: Some(self.platform.clone()),
            host: self.host.clone(),
            auth_method: Some(self.auth_method.to_string()),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Why a stored profile was left out of the valid set
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("token could not be decrypted: {0}")]
    DecryptionFailed(#[source] CodecError),
    #[error("invalid username '{0}'")]
    InvalidUsername(String),
    #[error("missing required field 'auth_method'")]
    MissingAuthMethod,
    #[error("invalid auth_method '{0}' (expected 'ssh' or 'https')")]
    InvalidAuthMethod(String),
    #[error("entry is not a profile object: {0}")]
    Malformed(String),
}

/// Outcome of validating one entry
#[derive(Debug)]
pub struct Validated {
    pub profile: Profile,
    /// Non-fatal finding, e.g. an email that does not look like one
    pub warning: Option<String>,
}

/// Fields supplied to an add or update; `None` means "not given"
#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub username: Option<String>,
    pub email: Option<String>,
    pub token: Option<Secret>,
    pub ssh_identity: Option<String>,
    pub platform: Option<String>,
    pub host: Option<String>,
    pub auth_method: Option<AuthMethod>,
}

/// Validate profile name
///
/// Allows ASCII alphanumerics, `_`, `.` and `-`.
pub fn validate_profile_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Profile name cannot be empty");
    }

    if let Some(c) = name.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        bail!(
            "Invalid profile name '{}': contains forbidden character {:?}",
            name,
            c
        );
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        bail!(
            "Invalid profile name '{}'.\n\n Only alphanumeric characters, dots (.), hyphens (-), and underscores (_) are allowed.",
            name
        );
    }

    Ok(())
}

/// Host-username grammar: 1-39 ASCII alphanumerics or `-`, alphanumeric at both ends
pub fn is_valid_username(username: &str) -> bool {
    let bytes = username.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_USERNAME_LENGTH {
        return false;
    }
    let first = bytes[0];
    let last = bytes[bytes.len() - 1];
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

pub fn is_plausible_email(email: &str) -> bool {
    email.validate_email()
}

/// Lowercase a platform id, falling back to github when empty
pub fn normalize_platform(platform: Option<&str>) -> String {
    match platform.map(str::trim) {
        Some(p) if !p.is_empty() => p.to_ascii_lowercase(),
        _ => DEFAULT_PLATFORM.to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validate one stored entry
///
/// Checks run in order and stop at the first failure: token decryption,
/// username grammar, email shape (warning only), auth method presence and
/// value, then platform normalization.
pub fn validate(
    name: &str,
    raw: &RawProfile,
    salt: &str,
) -> std::result::Result<Validated, ValidationError> {
    let token = raw.token.clone().filter(|t| !t.is_empty());
    if let Some(stored) = &token {
        if stored.is_encrypted() {
            codec::decrypt(stored.as_str(), salt).map_err(ValidationError::DecryptionFailed)?;
        }
    }

    if !is_valid_username(&raw.username) {
        return Err(ValidationError::InvalidUsername(raw.username.clone()));
    }

    let warning = (!is_plausible_email(&raw.email)).then(|| {
        format!(
            "Profile '{}' has an email that does not look valid: '{}'",
            name, raw.email
        )
    });

    let auth_method = match non_empty(&raw.auth_method) {
        None => return Err(ValidationError::MissingAuthMethod),
        Some(value) => value
            .parse::<AuthMethod>()
            .map_err(|_| ValidationError::InvalidAuthMethod(value.clone()))?,
    };

    Ok(Validated {
        profile: Profile {
            username: raw.username.clone(),
            email: raw.email.clone(),
            token,
            ssh_identity: non_empty(&raw.ssh_identity),
            platform: normalize_platform(raw.platform.as_deref()),
            host: non_empty(&raw.host),
            auth_method,
        },
        warning,
    })
}
