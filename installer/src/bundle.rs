//! Release bundle acquisition.
//!
//! A bundle is `containai-<version>-<target>.tar.gz` holding:
//!
//! ```text
//! payload.tar.gz          release tree
//! payload.sha256          digest of SHA256SUMS
//! SHA256SUMS              digests of the release tree and the SBOM
//! payload.sbom.json       software bill of materials
//! *.intoto.jsonl          DSSE attestations (payload tarball, SBOM)
//! tools/cosign-root.pem   offline copy of the trust root
//! ```
//!
//! It is taken from a local asset directory (the tarball, or its members
//! laid out loose) or downloaded from the GitHub release, then copied or
//! unpacked into a private staging directory so every later check reads
//! bytes nobody else can swap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use containai::error::{SecurityError, SecurityResult};
use containai::integrity::{find_checksum, is_sha256_hex, sha256_bytes, sha256_file, validate_relative_path, SUMS_FILE};

/// Release tree archive.
pub const PAYLOAD_TARBALL: &str = "payload.tar.gz";
/// Digest of `SHA256SUMS`.
pub const PAYLOAD_SHA256: &str = "payload.sha256";
/// Software bill of materials.
pub const SBOM: &str = "payload.sbom.json";
/// Attestation file suffix.
pub const ATTESTATION_SUFFIX: &str = ".intoto.jsonl";
/// Offline trust root inside the bundle.
pub const BUNDLED_ANCHOR: &str = "tools/cosign-root.pem";

/// Members that must be present in every bundle.
pub const REQUIRED_MEMBERS: [&str; 4] = [PAYLOAD_TARBALL, PAYLOAD_SHA256, SUMS_FILE, SBOM];

const USER_AGENT: &str = concat!("containai-install/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads release assets.
pub trait AssetFetcher {
    /// Fetch `url` into memory.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    fn fetch(&self, url: &str) -> SecurityResult<Vec<u8>>;
}

/// Blocking HTTPS fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Client with the installer user agent and a connect timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> SecurityResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SecurityError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> SecurityResult<Vec<u8>> {
        debug!(url, "downloading");
        let mut request = self.client.get(url);
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if url.starts_with("https://github.com/") || url.starts_with("https://api.github.com/") {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        let response = request
            .send()
            .map_err(|e| SecurityError::config(format!("download of {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SecurityError::config(format!(
                "download of {url} returned {status}"
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| SecurityError::config(format!("failed to read body of {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Parse a release tag (`v1.2.3` or `1.2.3`) as semver.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] for anything else.
pub fn parse_version_tag(tag: &str) -> SecurityResult<semver::Version> {
    let stripped = tag.strip_prefix('v').unwrap_or(tag);
    semver::Version::parse(stripped)
        .map_err(|e| SecurityError::config(format!("invalid release tag {tag:?}: {e}")))
}

/// Validate a GitHub `owner/repo` slug.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] if it is not exactly two
/// non-empty, URL-safe components.
pub fn validate_repo(repo: &str) -> SecurityResult<()> {
    let valid_part = |p: &str| {
        !p.is_empty()
            && p != "."
            && p != ".."
            && p.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match repo.split_once('/') {
        Some((owner, name)) if valid_part(owner) && valid_part(name) => Ok(()),
        _ => Err(SecurityError::config(format!(
            "invalid repository {repo:?}; expected OWNER/REPO"
        ))),
    }
}

/// Reject asset names with separators, traversal or control characters.
///
/// # Errors
///
/// Returns [`SecurityError::Configuration`] naming the problem.
pub fn validate_asset_name(name: &str) -> SecurityResult<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(SecurityError::config(format!("invalid asset name length: {name:?}")));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(SecurityError::config(format!(
            "asset name contains a path component: {name:?}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(SecurityError::config("asset name contains control characters"));
    }
    Ok(())
}

/// `containai-<version>-<target>.tar.gz`.
pub fn bundle_asset_name(version: &semver::Version, target: &str) -> String {
    format!("containai-{version}-{target}.tar.gz")
}

/// Download URL of a release asset.
pub fn release_asset_url(repo: &str, tag: &str, asset: &str) -> String {
    format!("https://github.com/{repo}/releases/download/{tag}/{asset}")
}

/// Directory removed on drop unless [`StagingDir::keep`] is called.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    /// Create a fresh, owner-only directory at `path`.
    ///
    /// Any leftover directory at the same path is removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> SecurityResult<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| SecurityError::io("failed to clear stale staging", &path, e))?;
        }
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&path)
            .map_err(|e| SecurityError::io("failed to create staging", &path, e))?;
        Ok(Self { path, armed: true })
    }

    /// The directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm cleanup and hand back the path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove staging");
            }
        }
    }
}

/// A bundle unpacked into staging.
#[derive(Debug, Clone)]
pub struct ReleaseBundle {
    /// Parsed release version.
    pub version: semver::Version,
    /// Directory holding the members.
    pub dir: PathBuf,
    /// Attestation files found.
    pub attestations: Vec<PathBuf>,
    /// Offline trust root, if the bundle carries one.
    pub trust_anchor_pem: Option<PathBuf>,
}

/// Digests established by the hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDigests {
    /// SHA-256 of `SHA256SUMS`.
    pub sums: String,
    /// SHA-256 of the payload tarball.
    pub payload: String,
    /// SHA-256 of the SBOM.
    pub sbom: String,
}

impl ReleaseBundle {
    /// Path of a member.
    pub fn member(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Check `payload.sha256` → `SHA256SUMS` → SBOM, and the payload tarball
    /// when `SHA256SUMS` lists it.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::TrustVerification`] naming the file whose
    /// digest does not match.
    pub fn verify_hash_chain(&self) -> SecurityResult<VerifiedDigests> {
        let sums_path = self.member(SUMS_FILE);
        let sums_bytes = std::fs::read(&sums_path)
            .map_err(|e| SecurityError::io("failed to read", &sums_path, e))?;
        let expected_sums = read_digest_file(&self.member(PAYLOAD_SHA256))?;
        let actual_sums = sha256_bytes(&sums_bytes);
        if actual_sums != expected_sums {
            return Err(SecurityError::trust(format!(
                "{SUMS_FILE} digest mismatch: {PAYLOAD_SHA256} expects {expected_sums}, got {actual_sums}"
            )));
        }

        let sums = String::from_utf8(sums_bytes)
            .map_err(|_| SecurityError::config(format!("{SUMS_FILE} is not UTF-8")))?;
        let expected_sbom = find_checksum(&sums, SBOM)?;
        let sbom = sha256_file(&self.member(SBOM))?;
        if sbom != expected_sbom {
            return Err(SecurityError::trust(format!(
                "{SBOM} digest mismatch: {SUMS_FILE} expects {expected_sbom}, got {sbom}"
            )));
        }

        let payload = sha256_file(&self.member(PAYLOAD_TARBALL))?;
        match find_checksum(&sums, PAYLOAD_TARBALL) {
            Ok(expected) if expected != payload => {
                return Err(SecurityError::trust(format!(
                    "{PAYLOAD_TARBALL} digest mismatch: {SUMS_FILE} expects {expected}, got {payload}"
                )));
            }
            Ok(_) => debug!("payload tarball matches its {SUMS_FILE} entry"),
            Err(_) => debug!("payload tarball not listed in {SUMS_FILE}"),
        }
        info!(version = %self.version, "release hash chain verified");
        Ok(VerifiedDigests {
            sums: actual_sums,
            payload,
            sbom,
        })
    }
}

/// Read a digest file: a bare hex digest, or a sums line naming `SHA256SUMS`.
fn read_digest_file(path: &Path) -> SecurityResult<String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| SecurityError::io("failed to read", path, e))?;
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| SecurityError::config(format!("{} is empty", path.display())))?;
    let mut parts = line.split_whitespace();
    let digest = parts.next().unwrap_or_default();
    if let Some(name) = parts.next() {
        let name = name.strip_prefix('*').unwrap_or(name);
        if name != SUMS_FILE && name.strip_prefix("./") != Some(SUMS_FILE) {
            return Err(SecurityError::config(format!(
                "{} names {name}, expected {SUMS_FILE}",
                path.display()
            )));
        }
    }
    if !is_sha256_hex(digest) {
        return Err(SecurityError::config(format!(
            "{} does not hold a SHA-256 digest",
            path.display()
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

/// Acquire the bundle for `tag` into `staging`.
///
/// # Errors
///
/// Fails on an invalid tag or repo, a download failure, an unsafe archive,
/// or a missing required member.
pub fn acquire(
    tag: &str,
    repo: &str,
    target: &str,
    asset_dir: Option<&Path>,
    fetcher: &dyn AssetFetcher,
    staging: &Path,
) -> SecurityResult<ReleaseBundle> {
    let version = parse_version_tag(tag)?;
    let asset = bundle_asset_name(&version, target);
    validate_asset_name(&asset)?;

    match asset_dir {
        Some(dir) if dir.join(&asset).is_file() => {
            info!(bundle = %dir.join(&asset).display(), "using local bundle");
            unpack_archive(&dir.join(&asset), staging)?;
        }
        Some(dir) => {
            info!(dir = %dir.display(), "using loose bundle members");
            copy_loose_members(dir, staging)?;
        }
        None => {
            validate_repo(repo)?;
            let url = release_asset_url(repo, tag, &asset);
            info!(url = %url, "downloading release bundle");
            let bytes = fetcher.fetch(&url)?;
            let archive = staging.join(&asset);
            std::fs::write(&archive, &bytes)
                .map_err(|e| SecurityError::io("failed to write", &archive, e))?;
            unpack_archive(&archive, staging)?;
            std::fs::remove_file(&archive)
                .map_err(|e| SecurityError::io("failed to remove", &archive, e))?;
        }
    }

    let dir = locate_bundle_root(staging)?;
    let missing: Vec<&str> = REQUIRED_MEMBERS
        .iter()
        .copied()
        .filter(|m| !dir.join(m).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(SecurityError::config(format!(
            "release bundle {asset} is missing {}",
            missing.join(", ")
        )));
    }

    let attestations = list_attestations(&dir)?;
    let anchor = dir.join(BUNDLED_ANCHOR);
    Ok(ReleaseBundle {
        version,
        dir,
        attestations,
        trust_anchor_pem: anchor.is_file().then_some(anchor),
    })
}

fn copy_loose_members(src: &Path, dest: &Path) -> SecurityResult<()> {
    let entries =
        std::fs::read_dir(src).map_err(|e| SecurityError::io("failed to read asset dir", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SecurityError::io("failed to read asset dir", src, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let wanted = REQUIRED_MEMBERS.contains(&name.as_str()) || name.ends_with(ATTESTATION_SUFFIX);
        if wanted && entry.path().is_file() {
            copy_file(&entry.path(), &dest.join(&name))?;
        }
    }
    let anchor = src.join(BUNDLED_ANCHOR);
    if anchor.is_file() {
        let target = dest.join(BUNDLED_ANCHOR);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SecurityError::io("failed to create", parent, e))?;
        }
        copy_file(&anchor, &target)?;
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> SecurityResult<()> {
    std::fs::copy(from, to).map_err(|e| SecurityError::io("failed to copy", from, e))?;
    Ok(())
}

/// Bundles may wrap their members in a single top-level directory.
fn locate_bundle_root(staging: &Path) -> SecurityResult<PathBuf> {
    if staging.join(PAYLOAD_TARBALL).is_file() {
        return Ok(staging.to_path_buf());
    }
    let dirs: Vec<PathBuf> = std::fs::read_dir(staging)
        .map_err(|e| SecurityError::io("failed to read staging", staging, e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [only] if only.join(PAYLOAD_TARBALL).is_file() => Ok(only.clone()),
        _ => Ok(staging.to_path_buf()),
    }
}

fn list_attestations(dir: &Path) -> SecurityResult<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| SecurityError::io("failed to read bundle", dir, e))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(ATTESTATION_SUFFIX))
        })
        .collect();
    found.sort();
    if found.is_empty() {
        warn!(dir = %dir.display(), "bundle carries no attestations");
    }
    Ok(found)
}

/// Unpack a `.tar.gz` into `dest`, refusing anything that could escape it.
///
/// Only regular files and directories are accepted.
///
/// # Errors
///
/// Fails on an unreadable archive, an absolute or `..` path, or a link or
/// device entry.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> SecurityResult<usize> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| SecurityError::io("failed to open archive", archive_path, e))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(false);

    let read_err = |e: std::io::Error| SecurityError::io("failed to read archive", archive_path, e);
    let mut count: usize = 0;
    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?.into_owned();
        let display = path.to_string_lossy().into_owned();
        validate_relative_path(&display).map_err(|_| {
            SecurityError::trust(format!(
                "archive {} contains unsafe path {display:?}",
                archive_path.display()
            ))
        })?;

        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(SecurityError::trust(format!(
                "archive {} contains unsupported entry {display:?} ({kind:?})",
                archive_path.display()
            )));
        }
        let unpacked = entry.unpack_in(dest).map_err(|e| {
            SecurityError::io("failed to unpack archive entry into", dest, e)
        })?;
        if !unpacked {
            return Err(SecurityError::trust(format!(
                "archive {} entry {display:?} escapes the destination",
                archive_path.display()
            )));
        }
        count = count.saturating_add(1);
    }
    debug!(archive = %archive_path.display(), entries = count, "unpacked archive");
    Ok(count)
}
