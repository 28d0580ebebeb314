//! Remote URL parsing and rewriting.
//!
//! Understands three shapes:
//! - `https://<host>/<path>` (an `http://` scheme and `user@` prefix are tolerated)
//! - `<user>@<host>:<path>` (scp-like)
//! - `ssh://[user@]<host>[:<port>]/<path>`

use crate::platform::{self, Registry};
use crate::profiles::{AuthMethod, Profile};

/// Host and repository path of a remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub host: String,
    pub path: String,
}

impl RemoteUrl {
    /// Parse a remote URL; `None` when neither grammar matches
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();

        if let Some(rest) = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
        {
            let (authority, path) = rest.split_once('/')?;
            let host = strip_userinfo(authority);
            return Self::build(host, path);
        }

        if let Some(rest) = url.strip_prefix("ssh://") {
            let (authority, path) = rest.split_once('/')?;
            let hostport = strip_userinfo(authority);
            let host = hostport.split(':').next().unwrap_or(hostport);
            return Self::build(host, path);
        }

        if url.contains("://") {
            return None;
        }

        let (user_host, path) = url.split_once(':')?;
        let (user, host) = user_host.split_once('@')?;
        if user.is_empty() {
            return None;
        }
        Self::build(host, path)
    }

    fn build(host: &str, path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        if host.is_empty() || path.is_empty() || host.contains('/') {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    /// `git@<alias>:<path>`
    pub fn to_ssh(&self, alias: &str) -> String {
        format!("git@{}:{}", alias, self.path)
    }

    /// `https://<host>/<path>`
    pub fn to_https(&self, host: &str) -> String {
        format!("https://{}/{}", host, self.path)
    }
}

fn strip_userinfo(authority: &str) -> &str {
    match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    }
}

/// Remote URL `current` should have for this profile, or `None` when `current`
/// cannot be parsed
///
/// SSH profiles point at their host alias; HTTPS profiles at their effective host.
pub fn target_url(
    current: &str,
    profile_name: &str,
    profile: &Profile,
    registry: &Registry,
) -> Option<String> {
    let remote = RemoteUrl::parse(current)?;
    Some(match profile.auth_method {
        AuthMethod::Ssh => remote.to_ssh(&platform::host_alias(&profile.platform, profile_name)),
        AuthMethod::Https => remote.to_https(&platform::effective_host(profile, registry)),
    })
}

/// Protocol of a remote URL as shown by diagnostics
pub fn protocol_of(url: &str) -> &'static str {
    let url = url.trim();
    if url.starts_with("https://") || url.starts_with("http://") {
        "https"
    } else if url.starts_with("ssh://") || RemoteUrl::parse(url).is_some() {
        "ssh"
    } else {
        "unknown"
    }
}
