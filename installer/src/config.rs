//! Installer settings and the baked-in release trust policy.
//!
//! The trust policy is fixed at build time. Nothing in the user's
//! configuration or environment at install time can change which root,
//! issuer or identity a release must chain to.

use std::path::PathBuf;

/// Sigstore public-good Fulcio root, used when the build does not pin another.
const DEFAULT_TRUST_ROOT_URL: &str =
    "https://raw.githubusercontent.com/sigstore/root-signing/main/targets/fulcio_v1.crt.pem";

/// GitHub Actions OIDC issuer, used when the build does not pin another.
const DEFAULT_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Where a release's attestations must chain to and who must have signed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    /// URL of the pinned root certificate bundle (PEM).
    pub root_cert_url: String,
    /// Expected SHA-256 of that bundle; empty when the build pinned none.
    pub root_cert_sha256: String,
    /// OIDC issuer the signing certificate must reference.
    pub oidc_issuer: String,
    /// Required prefix of the signer identity (SAN URI), if pinned.
    pub identity_prefix: Option<String>,
}

impl TrustPolicy {
    /// The policy compiled into this binary.
    pub fn baked() -> Self {
        Self {
            root_cert_url: option_env!("CONTAINAI_TRUST_ROOT_URL")
                .unwrap_or(DEFAULT_TRUST_ROOT_URL)
                .to_owned(),
            root_cert_sha256: option_env!("CONTAINAI_TRUST_ROOT_SHA256")
                .unwrap_or_default()
                .to_ascii_lowercase(),
            oidc_issuer: option_env!("CONTAINAI_OIDC_ISSUER")
                .unwrap_or(DEFAULT_OIDC_ISSUER)
                .to_owned(),
            identity_prefix: option_env!("CONTAINAI_IDENTITY_PREFIX")
                .filter(|p| !p.is_empty())
                .map(str::to_owned),
        }
    }
}

/// One installer invocation.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Release tag, e.g. `v1.4.0`.
    pub tag: String,
    /// GitHub `owner/repo` to download from.
    pub repo: String,
    /// Local directory holding the bundle (or its loose members).
    pub asset_dir: Option<PathBuf>,
    /// Compilation target the bundle was built for.
    pub target: String,
}

impl InstallRequest {
    /// Request for `tag` from `repo` built for this binary's target.
    pub fn new(tag: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            repo: repo.into(),
            asset_dir: None,
            target: env!("TARGET").to_owned(),
        }
    }

    /// Install from a local directory instead of downloading.
    #[must_use]
    pub fn with_asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.asset_dir = Some(dir.into());
        self
    }

    /// Override the target triple in the bundle asset name.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}
