//! Channel-scoped sandbox profiles and their hash manifest.
//!
//! Every channel carries its own copy of each required profile, suffixed
//! with the channel name so dev, nightly and prod policy can be loaded into
//! the kernel side by side:
//!
//! ```text
//! <root>/host/profiles/
//!     apparmor-containai-agent-prod.profile
//!     seccomp-containai-agent-prod.json
//!     ...
//!     containai-profiles-prod.sha256
//!     .containai-profiles-prod.loaded
//! ```
//!
//! The `.sha256` manifest records what the files should hash to. The
//! `.loaded` record is written only by the enforcer, after every AppArmor
//! profile it lists has been accepted by the kernel.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::channel::Channel;
use crate::error::{SecurityError, SecurityResult};
use crate::integrity::{is_sha256_hex, sha256_file};
use crate::lock::FileLock;

pub mod apparmor;
pub mod generator;

/// Profiles directory relative to an install root.
pub const PROFILES_SUBDIR: &str = "host/profiles";

/// Lock file guarding manifest rewrites, inside the profiles directory.
pub const MANIFEST_LOCK: &str = ".manifest.lock";

/// Base names that must have both a seccomp and an AppArmor profile.
pub const REQUIRED_BASES: [&str; 3] = [
    "containai-agent",
    "containai-proxy",
    "containai-log-forwarder",
];

/// Kind of kernel sandbox policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProfileKind {
    /// Seccomp syscall filter (JSON, handed to the container runtime).
    Seccomp,
    /// AppArmor profile (loaded into the kernel).
    AppArmor,
}

impl ProfileKind {
    /// Both kinds, in manifest order.
    pub const ALL: [Self; 2] = [Self::AppArmor, Self::Seccomp];

    /// File name prefix and template subdirectory.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seccomp => "seccomp",
            Self::AppArmor => "apparmor",
        }
    }

    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Seccomp => "json",
            Self::AppArmor => "profile",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One channel-qualified profile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecurityProfile {
    kind: ProfileKind,
    base_name: String,
    channel: Channel,
}

impl SecurityProfile {
    /// Profile for `base_name` on `channel`.
    pub fn new(kind: ProfileKind, base_name: impl Into<String>, channel: Channel) -> Self {
        Self {
            kind,
            base_name: base_name.into(),
            channel,
        }
    }

    /// Kind of policy.
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    /// Unqualified base name, e.g. `containai-agent`.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Channel the profile belongs to.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Name the kernel knows the profile by: `<base>-<channel>`.
    pub fn qualified_name(&self) -> String {
        qualify(&self.base_name, self.channel)
    }

    /// `<kind>-<base>-<channel>.<ext>`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.{}",
            self.kind.as_str(),
            self.qualified_name(),
            self.kind.extension()
        )
    }

    /// `<root>/host/profiles/<file_name>`.
    pub fn file_path(&self, root: &Path) -> PathBuf {
        self.path_in(&root.join(PROFILES_SUBDIR))
    }

    /// `<dir>/<file_name>`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Hash the profile file as it sits in `dir` right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn content_hash(&self, dir: &Path) -> SecurityResult<String> {
        sha256_file(&self.path_in(dir))
    }
}

impl fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// `<base>-<channel>`.
pub fn qualify(base: &str, channel: Channel) -> String {
    format!("{base}-{channel}")
}

/// The six profiles every channel must carry.
pub fn required_profiles(channel: Channel) -> Vec<SecurityProfile> {
    REQUIRED_BASES
        .iter()
        .flat_map(|base| {
            ProfileKind::ALL
                .into_iter()
                .map(move |kind| SecurityProfile::new(kind, *base, channel))
        })
        .collect()
}

/// `containai-profiles-<channel>.sha256`.
pub fn manifest_file_name(channel: Channel) -> String {
    format!("containai-profiles-{channel}.sha256")
}

/// `.containai-profiles-<channel>.loaded`.
pub fn load_record_file_name(channel: Channel) -> String {
    format!(".containai-profiles-{channel}.loaded")
}

/// Channel-scoped map of profile file name to SHA-256.
///
/// Serialized as one `<file_name> <hex>` line per entry, sorted by file
/// name, so identical inputs always give byte-identical manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileManifest {
    channel: Channel,
    entries: BTreeMap<String, String>,
}

impl ProfileManifest {
    /// Empty manifest for `channel`.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            entries: BTreeMap::new(),
        }
    }

    /// Channel the manifest covers.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Record (or replace) the hash for `file_name`.
    pub fn insert(&mut self, file_name: impl Into<String>, sha256: impl Into<String>) {
        self.entries.insert(file_name.into(), sha256.into());
    }

    /// Recorded hash for `file_name`.
    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.entries.get(file_name).map(String::as_str)
    }

    /// Entries in file name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse manifest text.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Configuration`] on a malformed line.
    pub fn parse(channel: Channel, content: &str) -> SecurityResult<Self> {
        let mut manifest = Self::new(channel);
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(digest), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(SecurityError::config(format!(
                    "malformed manifest line {}: {line:?}",
                    idx.saturating_add(1)
                )));
            };
            if name.contains('/') || !is_sha256_hex(digest) {
                return Err(SecurityError::config(format!(
                    "malformed manifest line {}: {line:?}",
                    idx.saturating_add(1)
                )));
            }
            manifest.insert(name, digest.to_ascii_lowercase());
        }
        Ok(manifest)
    }

    /// Serialized form.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(name, digest)| format!("{name} {digest}\n"))
            .collect()
    }

    /// Path of this channel's manifest inside `dir`.
    pub fn path_in(dir: &Path, channel: Channel) -> PathBuf {
        dir.join(manifest_file_name(channel))
    }

    /// Read the manifest for `channel` from `dir`; `Ok(None)` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(dir: &Path, channel: Channel) -> SecurityResult<Option<Self>> {
        Self::read_at(&Self::path_in(dir, channel), channel)
    }

    /// Read a manifest-formatted file at `path`; `Ok(None)` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read_at(path: &Path, channel: Channel) -> SecurityResult<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(channel, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SecurityError::io("failed to read manifest", path, e)),
        }
    }

    /// Rewrite the manifest in `dir` as a whole, under the manifest lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the file written.
    pub fn write(&self, dir: &Path) -> SecurityResult<PathBuf> {
        let path = Self::path_in(dir, self.channel);
        self.write_at(dir, &path)?;
        Ok(path)
    }

    /// Write this manifest to `path`, holding the lock in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the file written.
    pub fn write_at(&self, dir: &Path, path: &Path) -> SecurityResult<()> {
        let _lock = FileLock::acquire(&dir.join(MANIFEST_LOCK))?;
        write_atomic(path, self.render().as_bytes())?;
        debug!(path = %path.display(), entries = self.len(), "wrote profile manifest");
        Ok(())
    }

    /// Delete the manifest-formatted file at `path` if present, holding the
    /// lock in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the file removed.
    pub fn remove_at(dir: &Path, path: &Path) -> SecurityResult<()> {
        let _lock = FileLock::acquire(&dir.join(MANIFEST_LOCK))?;
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed profile manifest");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SecurityError::io("failed to remove", path, e)),
        }
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> SecurityResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SecurityError::config(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(SecurityError::io("failed to write", path, e));
    }
    Ok(())
}
