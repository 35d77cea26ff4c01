//! ContainAI release installer.
//!
//! Admits a release only after its integrity and provenance check out:
//! the installer verifies itself, the bundle's two-file hash chain is
//! checked, DSSE attestations are verified against a pinned root, and the
//! release is promoted into a versioned directory before `current` is
//! switched with a single rename.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anchor;
pub mod bundle;
pub mod config;
pub mod dsse;
pub mod install;
pub mod self_check;
