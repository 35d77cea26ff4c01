//! Security profile enforcer.
//!
//! Installs a channel's profile set: checks that every required file is in
//! place, records their hashes in the channel manifest and loads the
//! AppArmor profiles into the kernel in replace mode. Running it twice on
//! the same inputs produces the same manifest and reloads nothing.
//!
//! When anything has to be loaded, the manifest and the load record are
//! removed first and written back only after the last load succeeds, so a
//! failed run leaves the gate failing and the next run reloading.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::config::Context;
use crate::error::{SecurityError, SecurityResult};
use crate::kernel::{PolicyKernel, APPARMOR_PARSER_HINT};
use crate::profiles::{
    load_record_file_name, required_profiles, ProfileKind, ProfileManifest, SecurityProfile,
};

/// What happened to an AppArmor profile during enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    /// Loaded or replaced in the kernel.
    Loaded,
    /// Same hash as last time and already loaded; left alone.
    Unchanged,
}

/// Per-profile enforcement result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileStatus {
    /// The profile.
    pub profile: SecurityProfile,
    /// Hash recorded in the manifest.
    pub sha256: String,
    /// Kernel load outcome; `None` for seccomp profiles, which the
    /// container runtime applies per container.
    pub load: Option<LoadStatus>,
}

/// Result of a successful enforcement run.
#[derive(Debug, Clone)]
pub struct EnforcementReport {
    /// Channel enforced.
    pub channel: Channel,
    /// Manifest written (or confirmed unchanged).
    pub manifest_path: PathBuf,
    /// Whether the manifest bytes changed.
    pub manifest_changed: bool,
    /// One entry per required profile.
    pub profiles: Vec<ProfileStatus>,
}

impl EnforcementReport {
    fn count(&self, status: LoadStatus) -> usize {
        self.profiles
            .iter()
            .filter(|p| p.load == Some(status))
            .count()
    }

    /// Profiles loaded or replaced this run.
    pub fn loaded_count(&self) -> usize {
        self.count(LoadStatus::Loaded)
    }

    /// Profiles skipped because nothing changed.
    pub fn unchanged_count(&self) -> usize {
        self.count(LoadStatus::Unchanged)
    }
}

/// Install and load the required profiles for `ctx.channel()`.
///
/// An AppArmor profile is skipped only when the load record shows this
/// exact content was accepted by the kernel and the name is still loaded.
///
/// # Errors
///
/// Fails, in this order, when: any required profile file is missing (all
/// are listed), the loader tool is unavailable, the kernel lacks AppArmor,
/// the caller is unprivileged, the manifest cannot be written, or any
/// profile fails to load.
pub fn enforce(ctx: &Context, kernel: &dyn PolicyKernel) -> SecurityResult<EnforcementReport> {
    run(ctx, kernel, false)
}

/// Like [`enforce`], but loads every AppArmor profile regardless of what
/// the load record says.
///
/// Used when a release tree becomes active: the kernel may hold another
/// release's policy under the same channel-qualified names.
///
/// # Errors
///
/// Same as [`enforce`].
pub fn reload(ctx: &Context, kernel: &dyn PolicyKernel) -> SecurityResult<EnforcementReport> {
    run(ctx, kernel, true)
}

fn run(
    ctx: &Context,
    kernel: &dyn PolicyKernel,
    reload_all: bool,
) -> SecurityResult<EnforcementReport> {
    let channel = ctx.channel();
    let dir = ctx.profiles_dir();
    let profiles = required_profiles(channel);

    let missing: Vec<String> = profiles
        .iter()
        .filter(|p| !p.path_in(&dir).is_file())
        .map(SecurityProfile::file_name)
        .collect();
    if !missing.is_empty() {
        return Err(SecurityError::config(format!(
            "missing {channel} profiles in {}: {}; regenerate them or reinstall the release",
            dir.display(),
            missing.join(", ")
        )));
    }

    if !kernel.loader_available() {
        return Err(SecurityError::ToolMissing {
            tool: ctx.config().kernel.apparmor_parser.clone(),
            hint: APPARMOR_PARSER_HINT.to_owned(),
        });
    }
    if !kernel.apparmor_enabled() {
        return Err(SecurityError::PlatformUnsupported(
            "AppArmor is not enabled in this kernel".to_owned(),
        ));
    }
    if !ctx.is_privileged() {
        return Err(SecurityError::Privilege(format!(
            "loading {channel} AppArmor profiles requires root"
        )));
    }

    let manifest_path = ProfileManifest::path_in(&dir, channel);
    let record_path = dir.join(load_record_file_name(channel));
    let previous = read_or_discard(&manifest_path, channel);
    let record = if reload_all {
        None
    } else {
        read_or_discard(&record_path, channel)
    };

    let mut manifest = ProfileManifest::new(channel);
    let mut hashed = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let sha256 = profile.content_hash(&dir)?;
        manifest.insert(profile.file_name(), sha256.clone());
        hashed.push((profile, sha256));
    }

    let loaded: BTreeSet<String> = kernel.loaded_profiles().unwrap_or_default();
    let plan: Vec<(SecurityProfile, String, Option<LoadStatus>)> = hashed
        .into_iter()
        .map(|(profile, sha256)| {
            let load = match profile.kind() {
                ProfileKind::Seccomp => None,
                ProfileKind::AppArmor => {
                    let recorded = record
                        .as_ref()
                        .and_then(|m| m.get(&profile.file_name()))
                        == Some(sha256.as_str());
                    if recorded && loaded.contains(&profile.qualified_name()) {
                        Some(LoadStatus::Unchanged)
                    } else {
                        Some(LoadStatus::Loaded)
                    }
                }
            };
            (profile, sha256, load)
        })
        .collect();
    let pending = plan
        .iter()
        .any(|(_, _, load)| *load == Some(LoadStatus::Loaded));

    // Until every load succeeds, neither file may vouch for the new hashes.
    if pending {
        ProfileManifest::remove_at(&dir, &record_path)?;
        ProfileManifest::remove_at(&dir, &manifest_path)?;
    }

    let mut statuses = Vec::with_capacity(plan.len());
    for (profile, sha256, load) in plan {
        if load == Some(LoadStatus::Loaded) {
            kernel.load_profile(&profile.path_in(&dir))?;
            info!(profile = %profile.qualified_name(), "loaded apparmor profile");
        }
        statuses.push(ProfileStatus {
            profile,
            sha256,
            load,
        });
    }

    let manifest_changed = previous.as_ref() != Some(&manifest);
    if manifest_changed || pending {
        manifest.write_at(&dir, &manifest_path)?;
    }
    if pending || record.as_ref() != Some(&manifest) {
        manifest.write_at(&dir, &record_path)?;
    }

    let report = EnforcementReport {
        channel,
        manifest_path,
        manifest_changed,
        profiles: statuses,
    };
    info!(
        channel = %channel,
        loaded = report.loaded_count(),
        unchanged = report.unchanged_count(),
        "security profiles enforced"
    );
    Ok(report)
}

fn read_or_discard(path: &Path, channel: Channel) -> Option<ProfileManifest> {
    match ProfileManifest::read_at(path, channel) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable; rewriting it");
            None
        }
    }
}
