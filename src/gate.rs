//! Launch-time security gate.
//!
//! Run before every container start. Unlike the enforcer it does not fail
//! fast: each required profile gets its own verdict so the launcher can
//! refuse on FAIL, warn on WARN and show the operator exactly what is wrong.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::Context;
use crate::error::SecurityResult;
use crate::kernel::PolicyKernel;
use crate::profiles::{required_profiles, ProfileKind, ProfileManifest, SecurityProfile};

/// Graded outcome; ordering is severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Verified.
    Pass,
    /// Could not be verified; launch may proceed.
    Warn,
    /// Launch must be refused.
    Fail,
}

/// Verdict for one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileCheck {
    /// Profile file name.
    pub file: String,
    /// Kernel-visible name.
    pub name: String,
    /// Policy kind (`apparmor` / `seccomp`).
    pub kind: &'static str,
    /// Outcome.
    pub verdict: Verdict,
    /// Human-readable explanation.
    pub reason: String,
}

/// Result of a gate check.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    /// Channel checked.
    pub channel: Channel,
    /// `false` when the kernel lacks AppArmor.
    pub platform_supported: bool,
    /// Aggregate verdict.
    pub verdict: Verdict,
    /// One entry per required profile.
    pub checks: Vec<ProfileCheck>,
}

impl GateReport {
    /// Whether the launch may proceed.
    pub fn allows_launch(&self) -> bool {
        self.verdict != Verdict::Fail
    }

    /// Checks with the given verdict.
    pub fn with_verdict(&self, verdict: Verdict) -> impl Iterator<Item = &ProfileCheck> {
        self.checks.iter().filter(move |c| c.verdict == verdict)
    }
}

/// Grade every required profile for `ctx.channel()`.
///
/// Policy outcomes never surface as errors.
pub fn check(ctx: &Context, kernel: &dyn PolicyKernel) -> GateReport {
    let channel = ctx.channel();
    let dir = ctx.profiles_dir();
    let manifest = match ProfileManifest::read(&dir, channel) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "profile manifest unreadable");
            None
        }
    };
    let platform_supported = kernel.apparmor_enabled();
    let loaded = if platform_supported {
        kernel.loaded_profiles()
    } else {
        None
    };

    let checks: Vec<ProfileCheck> = required_profiles(channel)
        .into_iter()
        .map(|profile| {
            let (verdict, reason) = grade(
                ctx,
                kernel,
                &profile,
                manifest.as_ref(),
                platform_supported,
                loaded.as_ref(),
            );
            debug!(profile = %profile, ?verdict, %reason, "gate check");
            ProfileCheck {
                file: profile.file_name(),
                name: profile.qualified_name(),
                kind: profile.kind().as_str(),
                verdict,
                reason,
            }
        })
        .collect();

    let verdict = checks
        .iter()
        .map(|c| c.verdict)
        .max()
        .unwrap_or(Verdict::Pass);
    GateReport {
        channel,
        platform_supported,
        verdict,
        checks,
    }
}

fn grade(
    ctx: &Context,
    kernel: &dyn PolicyKernel,
    profile: &SecurityProfile,
    manifest: Option<&ProfileManifest>,
    platform_supported: bool,
    loaded: Option<&BTreeSet<String>>,
) -> (Verdict, String) {
    let dir = ctx.profiles_dir();
    let path = profile.path_in(&dir);
    if !path.is_file() {
        return (
            Verdict::Fail,
            format!("{} is missing; reinstall required", path.display()),
        );
    }

    if let Err(reason) = freshness(profile, &dir, manifest) {
        return (Verdict::Fail, reason);
    }

    if profile.kind() == ProfileKind::Seccomp {
        return (Verdict::Pass, "hash matches manifest".to_owned());
    }

    if !platform_supported {
        return (
            Verdict::Warn,
            "unsupported platform: AppArmor is not enabled in this kernel".to_owned(),
        );
    }

    let name = profile.qualified_name();
    if loaded.is_some_and(|set| set.contains(&name)) {
        return (Verdict::Pass, "loaded and hash matches manifest".to_owned());
    }

    if ctx.is_privileged() {
        return match kernel.load_profile(&path) {
            Ok(()) => (Verdict::Pass, "was not loaded; loaded now".to_owned()),
            Err(e) => (Verdict::Fail, format!("not loaded and loading failed: {e}")),
        };
    }

    match loaded {
        None => (
            Verdict::Warn,
            "cannot verify: loaded profile listing is unreadable".to_owned(),
        ),
        Some(_) => (
            Verdict::Warn,
            format!("{name} is not loaded; verification skipped, re-run with sudo"),
        ),
    }
}

fn freshness(
    profile: &SecurityProfile,
    dir: &std::path::Path,
    manifest: Option<&ProfileManifest>,
) -> Result<(), String> {
    let Some(manifest) = manifest else {
        return Err("profile manifest missing (possible tamper); re-run enforcement".to_owned());
    };
    let file_name = profile.file_name();
    let Some(expected) = manifest.get(&file_name) else {
        return Err(format!(
            "{file_name} not in manifest (possible tamper); re-run enforcement"
        ));
    };
    let actual: SecurityResult<String> = profile.content_hash(dir);
    match actual {
        Ok(actual) if actual == expected => Ok(()),
        Ok(actual) => Err(format!(
            "{file_name} hash {actual} differs from manifest {expected} (possible tamper)"
        )),
        Err(e) => Err(format!("{file_name} unreadable: {e}")),
    }
}
