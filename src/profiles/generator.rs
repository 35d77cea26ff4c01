//! Channel profile generator.
//!
//! Turns the unqualified templates shipped with a release into the
//! channel-suffixed artifacts and manifest the enforcer installs. Nothing is
//! written until every template has been read and rendered, so a broken
//! template set never leaves a half-populated output directory behind.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::channel::Channel;
use crate::error::{SecurityError, SecurityResult};
use crate::integrity::sha256_bytes;
use crate::profiles::apparmor::AppArmorTemplate;
use crate::profiles::{required_profiles, write_atomic, ProfileKind, ProfileManifest, SecurityProfile};

/// One generated profile file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    /// Which profile this is.
    pub profile: SecurityProfile,
    /// Where it was written.
    pub path: PathBuf,
    /// SHA-256 of the written bytes.
    pub sha256: String,
}

/// Result of a generator run.
#[derive(Debug, Clone)]
pub struct GeneratedSet {
    /// Channel the set was rendered for.
    pub channel: Channel,
    /// One artifact per required profile.
    pub artifacts: Vec<GeneratedArtifact>,
    /// Path of the written manifest.
    pub manifest_path: PathBuf,
    /// The manifest contents.
    pub manifest: ProfileManifest,
}

/// Template path for `profile` under `templates_dir`.
pub fn template_path(templates_dir: &Path, profile: &SecurityProfile) -> PathBuf {
    let kind = profile.kind();
    templates_dir
        .join(kind.as_str())
        .join(format!("{}.{}", profile.base_name(), kind.extension()))
}

/// Render every required template for `channel` into `out_dir`.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] listing every missing template,
/// or naming the first template that fails to parse or validate. In both
/// cases nothing is written.
pub fn generate(templates_dir: &Path, out_dir: &Path, channel: Channel) -> SecurityResult<GeneratedSet> {
    let mut rendered: Vec<(SecurityProfile, Vec<u8>)> = Vec::new();
    let mut missing: Vec<String> = Vec::new();

    for profile in required_profiles(channel) {
        let path = template_path(templates_dir, &profile);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                missing.push(path.display().to_string());
                continue;
            }
            Err(e) => return Err(SecurityError::io("failed to read template", &path, e)),
        };
        let output = render(&profile, &path, bytes, channel)?;
        rendered.push((profile, output));
    }

    if !missing.is_empty() {
        return Err(SecurityError::config(format!(
            "missing profile templates: {}",
            missing.join(", ")
        )));
    }

    std::fs::create_dir_all(out_dir)
        .map_err(|e| SecurityError::io("failed to create profile directory", out_dir, e))?;

    let mut manifest = ProfileManifest::new(channel);
    let mut artifacts = Vec::with_capacity(rendered.len());
    for (profile, bytes) in rendered {
        let path = profile.path_in(out_dir);
        write_atomic(&path, &bytes)?;
        let sha256 = sha256_bytes(&bytes);
        manifest.insert(profile.file_name(), sha256.clone());
        artifacts.push(GeneratedArtifact {
            profile,
            path,
            sha256,
        });
    }
    let manifest_path = manifest.write(out_dir)?;

    info!(
        channel = %channel,
        out = %out_dir.display(),
        artifacts = artifacts.len(),
        "generated channel profiles"
    );
    Ok(GeneratedSet {
        channel,
        artifacts,
        manifest_path,
        manifest,
    })
}

fn render(
    profile: &SecurityProfile,
    path: &Path,
    bytes: Vec<u8>,
    channel: Channel,
) -> SecurityResult<Vec<u8>> {
    match profile.kind() {
        ProfileKind::AppArmor => {
            let text = String::from_utf8(bytes).map_err(|_| {
                SecurityError::config(format!("{} is not valid UTF-8", path.display()))
            })?;
            let template = AppArmorTemplate::parse(&text).map_err(|e| in_file(path, e))?;
            if template.name() != profile.base_name() {
                return Err(SecurityError::config(format!(
                    "{} declares profile {:?}, expected {:?}",
                    path.display(),
                    template.name(),
                    profile.base_name()
                )));
            }
            let out = template.render(channel).map_err(|e| in_file(path, e))?;
            Ok(out.into_bytes())
        }
        ProfileKind::Seccomp => {
            serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| {
                SecurityError::config(format!("{} is not valid JSON: {e}", path.display()))
            })?;
            Ok(bytes)
        }
    }
}

fn in_file(path: &Path, err: SecurityError) -> SecurityError {
    match err {
        SecurityError::Configuration(msg) => {
            SecurityError::config(format!("{}: {msg}", path.display()))
        }
        other => other,
    }
}
