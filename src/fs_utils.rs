//! Filesystem utility functions
//!
//! Atomic replacement of small config files, owner-only permission handling
//! and `~` expansion for user-supplied paths.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Permission bits for secret-bearing files
pub const FILE_MODE: u32 = 0o600;
/// Permission bits for directories holding secret-bearing files
pub const DIR_MODE: u32 = 0o700;

/// Create a directory (and parents) restricted to the owner
pub fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    set_mode(dir, DIR_MODE)
}

/// Replace a file's content in one step
///
/// Writes a fresh owner-only temp file next to the target and renames it
/// over the target, so a reader never observes a partially written body.
/// A symlinked target is followed: the file it points at is replaced and the
/// link stays in place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let target = resolve_symlink(path);
    let parent = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    temp.write_all(content)
        .with_context(|| format!("Failed to write temp file for {}", target.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temp file for {}", target.display()))?;

    temp.persist(&target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}

/// The file a symlink points at, or `path` itself
fn resolve_symlink(path: &Path) -> PathBuf {
    let is_link = fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink());
    if !is_link {
        return path.to_path_buf();
    }
    fs::canonicalize(path)
        .or_else(|_| {
            // Dangling link: resolve the target relative to the link's directory
            fs::read_link(path).map(|link| match path.parent() {
                Some(dir) => dir.join(link),
                None => link,
            })
        })
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Force a file to 0600 and its parent directory to 0700
pub fn secure_permissions(path: &Path) -> Result<()> {
    set_mode(path, FILE_MODE)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            set_mode(parent, DIR_MODE)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Whether group/other have any access. `None` when the file is missing or
/// the platform has no unix permission bits.
#[cfg(unix)]
pub fn is_owner_only(path: &Path) -> Option<bool> {
    let meta = fs::metadata(path).ok()?;
    Some(meta.permissions().mode() & 0o077 == 0)
}

#[cfg(not(unix))]
pub fn is_owner_only(_path: &Path) -> Option<bool> {
    None
}

/// Octal permission string for display, e.g. `644`
#[cfg(unix)]
pub fn mode_string(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    Some(format!("{:o}", meta.permissions().mode() & 0o777))
}

#[cfg(not(unix))]
pub fn mode_string(_path: &Path) -> Option<String> {
    None
}

/// Expand a leading `~` against the given home directory
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("file.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_follows_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let dotfiles = temp_dir.path().join("dotfiles");
        fs::create_dir(&dotfiles).unwrap();
        let real = dotfiles.join("ssh_config");
        fs::write(&real, "old").unwrap();
        let link = temp_dir.path().join("config");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        write_atomic(&link, b"new").unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&real).unwrap(), "new");
        assert_eq!(fs::read_to_string(&link).unwrap(), "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_creates_owner_only_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds.json");
        fs::write(temp_dir.path().join("creds.json.tmp"), "stale").unwrap();

        write_atomic(&path, b"{}").unwrap();
        assert_eq!(mode_string(&path).as_deref(), Some("600"));
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cfg");
        fs::create_dir(&dir).unwrap();
        let file = dir.join("creds.json");
        fs::write(&file, "{}").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(is_owner_only(&file), Some(false));
        secure_permissions(&file).unwrap();
        assert_eq!(is_owner_only(&file), Some(true));
        assert_eq!(mode_string(&dir).as_deref(), Some("700"));
    }

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/octo");
        assert_eq!(
            expand_tilde("~/.ssh/id_ed25519", home),
            PathBuf::from("/home/octo/.ssh/id_ed25519")
        );
        assert_eq!(expand_tilde("~", home), PathBuf::from("/home/octo"));
        assert_eq!(expand_tilde("/abs/key", home), PathBuf::from("/abs/key"));
        assert_eq!(expand_tilde("~other/key", home), PathBuf::from("~other/key"));
    }
}
