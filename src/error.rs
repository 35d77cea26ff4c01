//! Error taxonomy shared by the generator, enforcer, integrity auditor and
//! installer.
//!
//! Every variant carries a message naming the artifact involved and, where
//! one exists, the remediation step. Only the launch gate grades outcomes;
//! everything else fails fast with one of these.

use std::path::{Path, PathBuf};

/// Classified failure of a trust or enforcement operation.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// A required file, argument or setting is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A hash, signature, certificate chain or issuer did not match.
    #[error("trust verification failed: {0}")]
    TrustVerification(String),

    /// The operation needs elevated privileges.
    #[error("privilege error: {0} (re-run with sudo)")]
    Privilege(String),

    /// The host kernel lacks the sandboxing feature.
    #[error("unsupported platform: {0}")]
    PlatformUnsupported(String),

    /// A required external tool is not installed.
    #[error("required tool missing: {tool} ({hint})")]
    ToolMissing {
        /// Tool name as looked up on `PATH`.
        tool: String,
        /// Installation hint shown to the operator.
        hint: String,
    },

    /// Filesystem access failed.
    #[error("{context} {}: {source}", path.display())]
    Io {
        /// What was being attempted.
        context: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl SecurityError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Shorthand for [`SecurityError::TrustVerification`].
    pub fn trust(message: impl Into<String>) -> Self {
        Self::TrustVerification(message.into())
    }

    /// Shorthand for [`SecurityError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns `true` for hash/signature/chain/issuer failures.
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Self::TrustVerification(_))
    }
}

/// Result alias for operations that fail with a [`SecurityError`].
pub type SecurityResult<T> = Result<T, SecurityError>;
