//! Kernel policy adapter.
//!
//! The enforcer and the launch gate talk to AppArmor only through
//! [`PolicyKernel`], so both can run against a fake kernel in tests and on
//! hosts without the feature. [`SystemKernel`] is the real thing: securityfs
//! for probing, `apparmor_parser` for loading.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::KernelConfig;
use crate::error::{SecurityError, SecurityResult};

/// Hint shown when the loader binary cannot be found.
pub const APPARMOR_PARSER_HINT: &str = "install the apparmor-utils (or apparmor) package";

/// Access to the kernel's mandatory access control policy.
pub trait PolicyKernel {
    /// Whether the AppArmor LSM is enabled on this host.
    fn apparmor_enabled(&self) -> bool;

    /// Names of loaded profiles, or `None` if the listing cannot be read
    /// (typically because the caller is unprivileged).
    fn loaded_profiles(&self) -> Option<BTreeSet<String>>;

    /// Whether the policy loader tool can be run.
    fn loader_available(&self) -> bool;

    /// Load (or replace) the profile in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the profile and the loader output.
    fn load_profile(&self, path: &Path) -> SecurityResult<()>;
}

/// AppArmor on the running host.
#[derive(Debug, Clone)]
pub struct SystemKernel {
    parser: String,
    securityfs: PathBuf,
    enabled_param: PathBuf,
}

impl SystemKernel {
    /// Kernel adapter using the `[kernel]` settings.
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            parser: config.apparmor_parser.clone(),
            securityfs: config.securityfs.clone(),
            enabled_param: config.apparmor_enabled_param.clone(),
        }
    }

    fn profiles_listing(&self) -> PathBuf {
        self.securityfs.join("apparmor").join("profiles")
    }

    fn resolve_parser(&self) -> Option<PathBuf> {
        if self.parser.contains('/') {
            let path = PathBuf::from(&self.parser);
            return path.is_file().then_some(path);
        }
        find_in_path(&self.parser)
    }
}

impl PolicyKernel for SystemKernel {
    fn apparmor_enabled(&self) -> bool {
        let enabled = std::fs::read_to_string(&self.enabled_param)
            .map(|v| v.trim().starts_with('Y'))
            .unwrap_or(false);
        enabled && self.securityfs.join("apparmor").is_dir()
    }

    fn loaded_profiles(&self) -> Option<BTreeSet<String>> {
        match std::fs::read_to_string(self.profiles_listing()) {
            Ok(content) => Some(parse_profile_listing(&content)),
            Err(e) => {
                debug!(error = %e, "apparmor profile listing unreadable");
                None
            }
        }
    }

    fn loader_available(&self) -> bool {
        self.resolve_parser().is_some()
    }

    fn load_profile(&self, path: &Path) -> SecurityResult<()> {
        let parser = self.resolve_parser().ok_or_else(|| SecurityError::ToolMissing {
            tool: self.parser.clone(),
            hint: APPARMOR_PARSER_HINT.to_owned(),
        })?;
        let output = Command::new(&parser)
            .arg("-r")
            .arg("-W")
            .arg(path)
            .output()
            .map_err(|e| SecurityError::io("failed to run apparmor_parser for", path, e))?;

        if output.status.success() {
            debug!(profile = %path.display(), "loaded apparmor profile");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("Permission denied") || stderr.contains("Access denied") {
            return Err(SecurityError::Privilege(format!(
                "loading {} was refused: {stderr}",
                path.display()
            )));
        }
        Err(SecurityError::config(format!(
            "apparmor_parser failed to load {} ({}): {stderr}",
            path.display(),
            output.status
        )))
    }
}

/// Parse `<securityfs>/apparmor/profiles`: one `name (mode)` per line.
pub fn parse_profile_listing(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.rsplit_once(" (") {
            Some((name, _mode)) => name.to_owned(),
            None => line.to_owned(),
        })
        .collect()
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|segment| segment.join(binary))
        .find(|candidate| candidate.is_file())
}
