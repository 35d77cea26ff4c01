//! Configuration loading and the per-invocation [`Context`].
//!
//! Loads `config.toml` from `$CONTAINAI_CONFIG` or
//! `~/.config/containai/config.toml`. Environment variables override file
//! values; file values override defaults. A missing file yields defaults.
//!
//! Trust material (pinned root URL, root digest, OIDC issuer) is deliberately
//! absent here: it is compiled into the installer and cannot be changed by a
//! user-writable file.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use crate::channel::Channel;
use crate::profiles::PROFILES_SUBDIR;

/// Fallback install root when no home directory can be resolved.
const SYSTEM_INSTALL_ROOT: &str = "/var/lib/containai";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainaiConfig {
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Kernel policy loader settings.
    pub kernel: KernelConfig,
    /// Integrity check behaviour.
    pub integrity: IntegrityConfig,
    /// Audit log settings.
    pub audit: AuditConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root holding `releases/`, `current` and `previous`.
    pub install_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
        }
    }
}

/// Where and how AppArmor policy is detected and loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Loader binary, looked up on `PATH` when not absolute.
    pub apparmor_parser: String,
    /// Mount point of securityfs.
    pub securityfs: PathBuf,
    /// Kernel module parameter reporting whether AppArmor is enabled.
    pub apparmor_enabled_param: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            apparmor_parser: "apparmor_parser".to_owned(),
            securityfs: PathBuf::from("/sys/kernel/security"),
            apparmor_enabled_param: PathBuf::from("/sys/module/apparmor/parameters/enabled"),
        }
    }
}

/// Integrity check behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Tolerate a missing `SHA256SUMS` on the dev channel (warning only).
    pub allow_missing_sums_on_dev: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            allow_missing_sums_on_dev: true,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSON lines file.
    pub log_path: PathBuf,
    /// Forward each event to the system log.
    pub syslog: bool,
    /// Tag used for system log entries.
    pub syslog_tag: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: default_install_root().join("audit.log"),
            syslog: true,
            syslog_tag: "containai".to_owned(),
        }
    }
}

impl ContainaiConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom environment resolver (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = match env("CONTAINAI_CONFIG") {
            Some(p) => PathBuf::from(p),
            None => config_dir()?.join("config.toml"),
        };
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };
        config.apply_overrides(env);
        Ok(config)
    }

    /// Parse configuration from a TOML string without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("invalid config TOML")
    }

    /// Apply environment variable overrides.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CONTAINAI_INSTALL_ROOT").filter(|v| !v.trim().is_empty()) {
            self.paths.install_root = PathBuf::from(v);
        }
        if let Some(v) = env("CONTAINAI_AUDIT_LOG").filter(|v| !v.trim().is_empty()) {
            self.audit.log_path = PathBuf::from(v);
        }
        if let Some(v) = env("CONTAINAI_APPARMOR_PARSER").filter(|v| !v.trim().is_empty()) {
            self.kernel.apparmor_parser = v;
        }
        if let Some(v) = env("CONTAINAI_SECURITYFS").filter(|v| !v.trim().is_empty()) {
            self.kernel.securityfs = PathBuf::from(v);
        }
        if let Some(v) = env("CONTAINAI_ALLOW_MISSING_SUMS") {
            match parse_bool(&v) {
                Some(b) => self.integrity.allow_missing_sums_on_dev = b,
                None => tracing::warn!(
                    var = "CONTAINAI_ALLOW_MISSING_SUMS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }
}

/// Immutable per-invocation inputs handed to every component entry point.
#[derive(Debug, Clone)]
pub struct Context {
    install_root: PathBuf,
    channel: Channel,
    privileged: bool,
    config: ContainaiConfig,
}

impl Context {
    /// Build a context, detecting privilege from the effective user id.
    pub fn new(install_root: impl Into<PathBuf>, channel: Channel, config: ContainaiConfig) -> Self {
        Self {
            install_root: install_root.into(),
            channel,
            privileged: nix::unistd::geteuid().is_root(),
            config,
        }
    }

    /// Same context with an explicit privilege flag.
    #[must_use]
    pub fn with_privileged(self, privileged: bool) -> Self {
        Self { privileged, ..self }
    }

    /// Same context rooted elsewhere (e.g. a staging tree).
    #[must_use]
    pub fn with_root(&self, install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            ..self.clone()
        }
    }

    /// Root directory the profiles live under.
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Channel being enforced or checked.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether the process may load kernel policy.
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ContainaiConfig {
        &self.config
    }

    /// `<root>/host/profiles`.
    pub fn profiles_dir(&self) -> PathBuf {
        self.install_root.join(PROFILES_SUBDIR)
    }
}

/// Resolve the config directory (`~/.config/containai/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(base.config_dir().join("containai"))
}

fn default_install_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|base| base.data_local_dir().join("containai"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_INSTALL_ROOT))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
