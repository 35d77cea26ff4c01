//! Build script for the installer crate.
//!
//! Exposes the `TARGET` triple for bundle asset names and bakes the release
//! trust policy into the binary. The policy comes from the release
//! pipeline's environment; a build without it refuses attested installs.

const TRUST_VARS: [&str; 4] = [
    "CONTAINAI_TRUST_ROOT_URL",
    "CONTAINAI_TRUST_ROOT_SHA256",
    "CONTAINAI_OIDC_ISSUER",
    "CONTAINAI_IDENTITY_PREFIX",
];

fn main() {
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_owned());
    println!("cargo:rustc-env=TARGET={target}");

    for var in TRUST_VARS {
        println!("cargo:rerun-if-env-changed={var}");
    }
}
