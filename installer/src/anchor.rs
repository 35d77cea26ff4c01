//! Pinned trust anchor.
//!
//! The root certificate bundle is fetched from a fixed URL (or read from the
//! bundle's offline copy) and its SHA-256 compared against the digest baked
//! into the installer before a single byte of it is parsed.

use std::path::Path;

use tracing::{info, warn};
use x509_parser::pem::Pem;

use containai::error::{SecurityError, SecurityResult};
use containai::integrity::sha256_bytes;

use crate::bundle::AssetFetcher;
use crate::config::TrustPolicy;

/// Root (and optional intermediate) certificates, hash-verified.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    certificates: Vec<Vec<u8>>,
    sha256: String,
}

impl TrustAnchor {
    /// Verify `pem` against `expected_sha256`, then parse its certificates.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::TrustVerification`] on a digest mismatch and
    /// [`SecurityError::Configuration`] when no digest is pinned or the
    /// bundle holds no parseable certificate.
    pub fn from_pem_pinned(pem: &[u8], expected_sha256: &str) -> SecurityResult<Self> {
        if expected_sha256.is_empty() {
            return Err(SecurityError::config(
                "this installer was built without a pinned trust root digest",
            ));
        }
        let actual = sha256_bytes(pem);
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            return Err(SecurityError::trust(format!(
                "trust root digest mismatch: expected {expected_sha256}, got {actual}"
            )));
        }

        let mut certificates = Vec::new();
        for block in Pem::iter_from_buffer(pem) {
            let block = block
                .map_err(|e| SecurityError::config(format!("malformed trust root PEM: {e}")))?;
            if block.label != "CERTIFICATE" {
                continue;
            }
            x509_parser::parse_x509_certificate(&block.contents).map_err(|e| {
                SecurityError::config(format!("unparseable trust root certificate: {e}"))
            })?;
            certificates.push(block.contents);
        }
        if certificates.is_empty() {
            return Err(SecurityError::config("trust root bundle holds no certificates"));
        }
        Ok(Self {
            certificates,
            sha256: actual,
        })
    }

    /// DER certificates in bundle order.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// Digest of the PEM bundle.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

/// Fetch the pinned root, falling back to `bundled` when offline.
///
/// Either source must match the pinned digest.
///
/// # Errors
///
/// Fails when neither source yields a bundle with the pinned digest.
pub fn load_anchor(
    policy: &TrustPolicy,
    fetcher: &dyn AssetFetcher,
    bundled: Option<&Path>,
) -> SecurityResult<TrustAnchor> {
    let fetched = fetcher.fetch(&policy.root_cert_url);
    let pem = match (fetched, bundled) {
        (Ok(pem), _) => {
            info!(url = %policy.root_cert_url, "fetched trust root");
            pem
        }
        (Err(e), Some(path)) => {
            warn!(error = %e, fallback = %path.display(), "trust root fetch failed; using bundled copy");
            std::fs::read(path).map_err(|e| SecurityError::io("failed to read", path, e))?
        }
        (Err(e), None) => return Err(e),
    };
    TrustAnchor::from_pem_pinned(&pem, &policy.root_cert_sha256)
}
