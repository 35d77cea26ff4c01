//! Blue/green release installation.
//!
//! Layout under the install root:
//!
//! ```text
//! releases/<version>/   verified release trees
//! current  -> releases/<version>
//! previous -> releases/<older>
//! .staging/             in-flight acquisitions and extractions
//! .install.lock
//! ```
//!
//! Everything up to the final rename of `current` happens off to the side,
//! so any failure leaves the running release exactly as it was. A tree is
//! verified in full before its profiles reach the kernel; if loading them
//! fails part-way, the current release's profiles are loaded again.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tracing::{debug, info, warn};

use containai::channel::Channel;
use containai::config::Context;
use containai::enforcer;
use containai::error::{SecurityError, SecurityResult};
use containai::integrity::audit::AuditLog;
use containai::integrity::{
    sha256_file, unlisted_files, verify_tree_excluding, IntegrityPolicy, IntegrityReport,
    SUMS_FILE,
};
use containai::kernel::PolicyKernel;
use containai::lock::FileLock;
use containai::profiles::{
    generator, load_record_file_name, manifest_file_name, required_profiles, MANIFEST_LOCK,
    PROFILES_SUBDIR,
};

use crate::anchor::load_anchor;
use crate::bundle::{self, unpack_archive, AssetFetcher, ReleaseBundle, StagingDir, VerifiedDigests, PAYLOAD_TARBALL, SBOM};
use crate::config::{InstallRequest, TrustPolicy};
use crate::dsse::{load_attestations, verify_subject, AttestationSet, SubjectExpectation};
use crate::self_check::SelfIntegrity;

/// Directory holding verified release trees.
pub const RELEASES_DIR: &str = "releases";
/// Symlink to the active release.
pub const CURRENT_LINK: &str = "current";
/// Symlink to the release active before the last switch.
pub const PREVIOUS_LINK: &str = "previous";
/// Scratch space for acquisition and extraction.
pub const STAGING_DIR: &str = ".staging";
/// Lock serialising installs.
pub const INSTALL_LOCK: &str = ".install.lock";
/// Profile templates a payload may ship instead of rendered profiles.
pub const TEMPLATES_SUBDIR: &str = "host/templates";

/// Collaborators an install needs.
pub struct InstallDeps<'a> {
    /// Downloads bundles and the trust root.
    pub fetcher: &'a dyn AssetFetcher,
    /// Loads AppArmor profiles.
    pub kernel: &'a dyn PolicyKernel,
    /// Records the install.
    pub audit: &'a AuditLog,
    /// Checks the installer binary.
    pub self_integrity: &'a dyn SelfIntegrity,
    /// Baked-in trust policy.
    pub trust: &'a TrustPolicy,
}

/// What an invocation achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// A release is now `current`.
    Installed {
        /// Installed version.
        version: semver::Version,
        /// `releases/<version>`.
        path: PathBuf,
        /// An already-present, verified release tree was reused.
        reused: bool,
        /// Attestations were verified (false only on dev without them).
        attested: bool,
    },
    /// `--verify-only` result.
    Verified {
        /// Resolved target of `current`.
        path: PathBuf,
        /// Files checked; zero when a missing sums file was tolerated.
        files: usize,
    },
}

/// Acquire, verify and activate the release named by `request`.
///
/// # Errors
///
/// Any verification failure aborts before `current` changes.
pub fn install(
    ctx: &Context,
    request: &InstallRequest,
    deps: &InstallDeps<'_>,
) -> anyhow::Result<InstallOutcome> {
    deps.self_integrity
        .verify()
        .context("installer self-integrity check failed")?;

    let root = ctx.install_root();
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create install root {}", root.display()))?;
    let _lock = FileLock::acquire(&root.join(INSTALL_LOCK))?;

    let staging_root = root.join(STAGING_DIR);
    clear_stale_staging(&staging_root);

    let bundle_dir = StagingDir::create(
        staging_root.join(format!("bundle-{}", std::process::id())),
    )?;
    let bundle = bundle::acquire(
        &request.tag,
        &request.repo,
        &request.target,
        request.asset_dir.as_deref(),
        deps.fetcher,
        bundle_dir.path(),
    )?;
    let digests = bundle.verify_hash_chain()?;
    let attested = verify_attestations(ctx, &bundle, &digests, deps)?;

    let version_name = bundle.version.to_string();
    let release_dir = root.join(RELEASES_DIR).join(&version_name);
    let reused = if release_dir.exists() {
        verify_release_tree(ctx.channel(), &release_dir, &digests.sums).with_context(|| {
            format!(
                "existing {} failed verification; remove it and retry",
                release_dir.display()
            )
        })?;
        activate_profiles(ctx, &release_dir, deps.kernel)?;
        info!(release = %release_dir.display(), "reusing verified release");
        true
    } else {
        stage_release(ctx, &bundle, &digests, &staging_root, &release_dir, deps.kernel)?;
        false
    };

    if let Err(e) = swap_current(root, &version_name) {
        restore_current(ctx, deps.kernel);
        return Err(e.into());
    }
    drop(bundle_dir);

    deps.audit.record(
        "install",
        serde_json::json!({
            "version": version_name,
            "path": release_dir.display().to_string(),
            "channel": ctx.channel(),
            "reused": reused,
            "attested": attested,
            "payload_sha256": digests.payload,
        }),
    );
    info!(version = %bundle.version, channel = %ctx.channel(), "release installed");

    Ok(InstallOutcome::Installed {
        version: bundle.version,
        path: release_dir,
        reused,
        attested,
    })
}

/// Re-run the integrity check against the target of `current`.
///
/// # Errors
///
/// Fails when there is no current release or it does not verify.
pub fn verify_current(ctx: &Context) -> anyhow::Result<InstallOutcome> {
    let current = ctx.install_root().join(CURRENT_LINK);
    let target = std::fs::canonicalize(&current)
        .with_context(|| format!("no current release at {}", current.display()))?;
    let policy = IntegrityPolicy {
        channel: ctx.channel(),
        allow_missing_sums_on_dev: ctx.config().integrity.allow_missing_sums_on_dev,
    };
    let sums_path = target.join(SUMS_FILE);
    let files = match verify_tree_excluding(&target, &sums_path, policy, &[PAYLOAD_TARBALL])? {
        IntegrityReport::Verified { files } => {
            reject_unlisted(&target, &sums_path)?;
            files
        }
        IntegrityReport::SumsMissingTolerated => 0,
    };
    Ok(InstallOutcome::Verified {
        path: target,
        files,
    })
}

fn verify_attestations(
    ctx: &Context,
    bundle: &ReleaseBundle,
    digests: &VerifiedDigests,
    deps: &InstallDeps<'_>,
) -> SecurityResult<bool> {
    let lines = match load_attestations(&bundle.attestations)? {
        AttestationSet::Present(lines) => lines,
        set if ctx.channel().is_lenient() => {
            warn!(
                channel = %ctx.channel(),
                attestations = ?set,
                "release is not attested; continuing on dev channel"
            );
            return Ok(false);
        }
        AttestationSet::Missing | AttestationSet::Placeholder => {
            return Err(SecurityError::trust(format!(
                "release {} carries no attestation; {} installs require one",
                bundle.version,
                ctx.channel()
            )));
        }
    };

    let anchor = load_anchor(deps.trust, deps.fetcher, bundle.trust_anchor_pem.as_deref())?;
    for (artifact, digest) in [(PAYLOAD_TARBALL, &digests.payload), (SBOM, &digests.sbom)] {
        verify_subject(
            &lines,
            &anchor,
            deps.trust,
            SubjectExpectation {
                sha256: digest,
                name_suffix: Some(artifact),
            },
        )?;
    }
    Ok(true)
}

fn stage_release(
    ctx: &Context,
    bundle: &ReleaseBundle,
    digests: &VerifiedDigests,
    staging_root: &Path,
    release_dir: &Path,
    kernel: &dyn PolicyKernel,
) -> anyhow::Result<()> {
    let staging = StagingDir::create(
        staging_root.join(format!("{}-{}", bundle.version, std::process::id())),
    )?;
    let tree = staging.path();

    unpack_archive(&bundle.member(PAYLOAD_TARBALL), tree)?;
    for member in [SUMS_FILE, SBOM] {
        std::fs::copy(bundle.member(member), tree.join(member))
            .with_context(|| format!("failed to stage {member}"))?;
    }
    verify_release_tree(ctx.channel(), tree, &digests.sums)?;

    let templates = tree.join(TEMPLATES_SUBDIR);
    if templates.is_dir() {
        generator::generate(&templates, &ctx.with_root(tree).profiles_dir(), ctx.channel())?;
    }
    activate_profiles(ctx, tree, kernel)?;

    let promoted = promote(tree, release_dir);
    if let Err(e) = promoted {
        restore_current(ctx, kernel);
        return Err(e);
    }
    staging.keep();
    info!(release = %release_dir.display(), "release promoted");
    Ok(())
}

fn promote(tree: &Path, release_dir: &Path) -> anyhow::Result<()> {
    let releases = release_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("release dir has no parent"))?;
    std::fs::create_dir_all(releases)
        .with_context(|| format!("failed to create {}", releases.display()))?;
    std::fs::rename(tree, release_dir).with_context(|| {
        format!(
            "failed to promote {} to {}",
            tree.display(),
            release_dir.display()
        )
    })
}

/// Check a release tree against the `SHA256SUMS` the hash chain vouched
/// for: the tree's copy must be that file, every listed file must match,
/// and nothing outside it may be present apart from generated profiles.
fn verify_release_tree(channel: Channel, tree: &Path, sums_sha256: &str) -> SecurityResult<()> {
    let sums_path = tree.join(SUMS_FILE);
    let actual = sha256_file(&sums_path)?;
    if actual != sums_sha256 {
        return Err(SecurityError::trust(format!(
            "{} does not match the verified bundle: expected {sums_sha256}, got {actual}",
            sums_path.display()
        )));
    }
    verify_tree_excluding(
        tree,
        &sums_path,
        IntegrityPolicy::strict(channel),
        &[PAYLOAD_TARBALL],
    )?;
    reject_unlisted(tree, &sums_path)
}

fn reject_unlisted(tree: &Path, sums_path: &Path) -> SecurityResult<()> {
    let unlisted = unlisted_files(tree, sums_path, &generated_outputs(tree))?;
    if unlisted.is_empty() {
        return Ok(());
    }
    Err(SecurityError::trust(format!(
        "{} holds files not listed in {SUMS_FILE}: {}",
        tree.display(),
        unlisted.join(", ")
    )))
}

/// Paths the generator and enforcer write into a release tree. Rendered
/// profiles count only when the tree ships the templates they come from.
fn generated_outputs(tree: &Path) -> Vec<String> {
    let in_profiles = |name: &str| format!("{PROFILES_SUBDIR}/{name}");
    let mut outputs = vec![SUMS_FILE.to_owned(), in_profiles(MANIFEST_LOCK)];
    let has_templates = tree.join(TEMPLATES_SUBDIR).is_dir();
    for channel in Channel::ALL {
        outputs.push(in_profiles(&manifest_file_name(channel)));
        outputs.push(in_profiles(&load_record_file_name(channel)));
        if has_templates {
            outputs.extend(
                required_profiles(channel)
                    .iter()
                    .map(|p| in_profiles(&p.file_name())),
            );
        }
    }
    outputs
}

/// Load every profile `tree` carries. On failure the kernel may hold a
/// mix of both releases, so the active release's profiles are put back.
fn activate_profiles(ctx: &Context, tree: &Path, kernel: &dyn PolicyKernel) -> SecurityResult<()> {
    match enforcer::reload(&ctx.with_root(tree), kernel) {
        Ok(report) => {
            debug!(tree = %tree.display(), loaded = report.loaded_count(), "profiles activated");
            Ok(())
        }
        Err(e) => {
            restore_current(ctx, kernel);
            Err(e)
        }
    }
}

fn restore_current(ctx: &Context, kernel: &dyn PolicyKernel) {
    let current = ctx.install_root().join(CURRENT_LINK);
    let Ok(target) = std::fs::canonicalize(&current) else {
        return;
    };
    match enforcer::reload(&ctx.with_root(&target), kernel) {
        Ok(_) => warn!(release = %target.display(), "reloaded profiles of the current release"),
        Err(e) => warn!(
            release = %target.display(),
            error = %e,
            "could not reload profiles of the current release; run `containai enforce`"
        ),
    }
}

/// Point `current` at `releases/<release_name>`, moving the old target to
/// `previous`. Each link is replaced by renaming a fresh symlink over it.
///
/// # Errors
///
/// Returns an error if a symlink cannot be created or renamed.
pub fn swap_current(root: &Path, release_name: &str) -> SecurityResult<()> {
    let current = root.join(CURRENT_LINK);
    let new_target = Path::new(RELEASES_DIR).join(release_name);
    let old_target = std::fs::read_link(&current).ok();
    if old_target.as_deref() == Some(new_target.as_path()) {
        return Ok(());
    }
    if let Some(old) = &old_target {
        replace_symlink(root, PREVIOUS_LINK, old)?;
    }
    replace_symlink(root, CURRENT_LINK, &new_target)?;
    info!(current = %new_target.display(), previous = ?old_target, "switched current release");
    Ok(())
}

#[cfg(unix)]
fn replace_symlink(root: &Path, name: &str, target: &Path) -> SecurityResult<()> {
    let tmp = root.join(format!(".{name}.tmp-{}", std::process::id()));
    if tmp.symlink_metadata().is_ok() {
        std::fs::remove_file(&tmp).map_err(|e| SecurityError::io("failed to remove", &tmp, e))?;
    }
    std::os::unix::fs::symlink(target, &tmp)
        .map_err(|e| SecurityError::io("failed to create symlink", &tmp, e))?;
    let link = root.join(name);
    std::fs::rename(&tmp, &link).map_err(|e| SecurityError::io("failed to replace", &link, e))
}

#[cfg(not(unix))]
fn replace_symlink(_root: &Path, _name: &str, _target: &Path) -> SecurityResult<()> {
    Err(SecurityError::PlatformUnsupported(
        "release switching needs symlinks".to_owned(),
    ))
}

fn clear_stale_staging(staging_root: &Path) {
    if staging_root.exists() {
        if let Err(e) = std::fs::remove_dir_all(staging_root) {
            warn!(path = %staging_root.display(), error = %e, "failed to clear stale staging");
        }
    }
}
