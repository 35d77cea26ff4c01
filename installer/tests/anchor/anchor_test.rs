//! Pinned trust root loading.

use containai::error::SecurityError;
use containai::integrity::sha256_bytes;

use installer::anchor::{load_anchor, TrustAnchor};

use crate::support::{Pki, StaticFetcher, ROOT_URL};

#[test]
fn pinned_bundle_parses_every_certificate() {
    let pki = Pki::github();
    let anchor = TrustAnchor::from_pem_pinned(&pki.anchor_pem, &sha256_bytes(&pki.anchor_pem))
        .expect("anchor");
    assert_eq!(anchor.certificates().len(), 2);
    assert_eq!(anchor.sha256(), sha256_bytes(&pki.anchor_pem));
}

#[test]
fn digest_mismatch_is_refused_before_parsing() {
    let garbage = b"not a certificate at all";
    let err = TrustAnchor::from_pem_pinned(garbage, &sha256_bytes(b"other")).expect_err("pin");
    assert!(err.is_trust_failure());
    assert!(err.to_string().contains("digest mismatch"));
}

#[test]
fn unpinned_build_refuses_attested_installs() {
    let pki = Pki::github();
    let err = TrustAnchor::from_pem_pinned(&pki.anchor_pem, "").expect_err("unpinned");
    assert!(matches!(err, SecurityError::Configuration(_)));
}

#[test]
fn pinned_bundle_without_certificates_is_refused() {
    let pem = b"-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n";
    assert!(TrustAnchor::from_pem_pinned(pem, &sha256_bytes(pem)).is_err());
}

#[test]
fn fetched_root_is_preferred() {
    let pki = Pki::github();
    let fetcher = StaticFetcher::default().with(ROOT_URL, pki.anchor_pem.clone());

    let anchor = load_anchor(&pki.policy(), &fetcher, None).expect("anchor");
    assert_eq!(anchor.certificates().len(), 2);
    assert_eq!(fetcher.requests(), vec![ROOT_URL.to_owned()]);
}

#[test]
fn offline_falls_back_to_bundled_copy() {
    let pki = Pki::github();
    let dir = tempfile::tempdir().expect("tempdir");
    let bundled = dir.path().join("cosign-root.pem");
    std::fs::write(&bundled, &pki.anchor_pem).expect("write");

    let anchor = load_anchor(&pki.policy(), &StaticFetcher::default(), Some(&bundled))
        .expect("fallback");
    assert_eq!(anchor.sha256(), sha256_bytes(&pki.anchor_pem));
}

#[test]
fn tampered_bundled_copy_is_refused() {
    let pki = Pki::github();
    let other = Pki::github();
    let dir = tempfile::tempdir().expect("tempdir");
    let bundled = dir.path().join("cosign-root.pem");
    std::fs::write(&bundled, &other.anchor_pem).expect("write");

    let err = load_anchor(&pki.policy(), &StaticFetcher::default(), Some(&bundled))
        .expect_err("tampered");
    assert!(err.is_trust_failure());
}

#[test]
fn offline_without_bundled_copy_fails() {
    let pki = Pki::github();
    assert!(load_anchor(&pki.policy(), &StaticFetcher::default(), None).is_err());
}
