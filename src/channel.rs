//! Deployment channels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Deployment track controlling profile naming and verification strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Local development builds.
    Dev,
    /// Nightly pre-releases.
    Nightly,
    /// Stable releases.
    Prod,
}

impl Channel {
    /// All channels, in strictness order.
    pub const ALL: [Channel; 3] = [Channel::Dev, Channel::Nightly, Channel::Prod];

    /// Lowercase name used in file names and profile suffixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Nightly => "nightly",
            Self::Prod => "prod",
        }
    }

    /// Whether verification failures may degrade to warnings.
    ///
    /// Only missing attestations and a missing `SHA256SUMS` are ever
    /// downgraded, and only on `dev`.
    pub fn is_lenient(&self) -> bool {
        match self {
            Self::Dev => true,
            Self::Nightly | Self::Prod => false,
        }
    }

    /// Suffix appended to base profile names, e.g. `-prod`.
    pub fn suffix(&self) -> String {
        format!("-{}", self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "nightly" => Ok(Self::Nightly),
            "prod" => Ok(Self::Prod),
            other => Err(SecurityError::config(format!(
                "unknown channel '{other}', expected one of dev, nightly, prod"
            ))),
        }
    }
}
