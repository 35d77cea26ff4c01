//! End-to-end installs from local bundles into a temporary root.

use std::path::Path;

use containai::integrity::audit::{read_events, AuditLog};
use containai::kernel::PolicyKernel;
use containai::Channel;

use installer::config::{InstallRequest, TrustPolicy};
use installer::install::{install, verify_current, InstallDeps, InstallOutcome};

use crate::support::{
    context, Attestation, FakeKernel, FixedIntegrity, Pki, ReleaseFixture, StaticFetcher, REPO,
    TARGET,
};

struct Harness {
    _tmp: tempfile::TempDir,
    root: std::path::PathBuf,
    assets: std::path::PathBuf,
    audit: AuditLog,
}

impl Harness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("root");
        let assets = tmp.path().join("assets");
        let audit = AuditLog::new(tmp.path().join("audit.log"));
        Self {
            _tmp: tmp,
            root,
            assets,
            audit,
        }
    }

    fn release(&self, version: &str, pki: &Pki, attestation: Attestation) -> ReleaseFixture {
        ReleaseFixture::write(&self.assets.join(version), version, pki, attestation)
    }

    fn run(
        &self,
        fixture: &ReleaseFixture,
        channel: Channel,
        trust: &TrustPolicy,
        kernel: &dyn PolicyKernel,
    ) -> anyhow::Result<InstallOutcome> {
        let fetcher = StaticFetcher::default();
        let deps = InstallDeps {
            fetcher: &fetcher,
            kernel,
            audit: &self.audit,
            self_integrity: &FixedIntegrity(true),
            trust,
        };
        let request = InstallRequest::new(fixture.tag(), REPO)
            .with_asset_dir(&fixture.dir)
            .with_target(TARGET);
        install(&context(&self.root, channel), &request, &deps)
    }

    fn current(&self) -> Option<std::path::PathBuf> {
        std::fs::read_link(self.root.join("current")).ok()
    }

    fn releases(&self) -> Vec<String> {
        match std::fs::read_dir(self.root.join("releases")) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }
}

fn corrupt_sums_entry(dir: &Path, file: &str) {
    let sums_path = dir.join("SHA256SUMS");
    let sums = std::fs::read_to_string(&sums_path).expect("sums");
    let patched: String = sums
        .lines()
        .map(|line| {
            if line.ends_with(file) {
                format!("{}  {file}\n", "0".repeat(64))
            } else {
                format!("{line}\n")
            }
        })
        .collect();
    std::fs::write(&sums_path, &patched).expect("write sums");
    std::fs::write(
        dir.join("payload.sha256"),
        format!("{}  SHA256SUMS\n", containai::integrity::sha256_bytes(patched.as_bytes())),
    )
    .expect("rehash sums");
}

#[test]
fn attested_prod_release_installs_and_switches_current() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    let kernel = FakeKernel::new();

    let outcome = h
        .run(&fixture, Channel::Prod, &pki.policy(), &kernel)
        .expect("install");
    let InstallOutcome::Installed {
        version,
        path,
        reused,
        attested,
    } = outcome
    else {
        panic!("expected an install");
    };
    assert_eq!(version.to_string(), "1.2.0");
    assert!(attested);
    assert!(!reused);
    assert_eq!(path, h.root.join("releases/1.2.0"));
    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));

    assert!(path.join("bin/containai").is_file());
    assert!(path.join("SHA256SUMS").is_file());
    assert!(path.join("payload.sbom.json").is_file());
    assert!(path
        .join("host/profiles/apparmor-containai-agent-prod.profile")
        .is_file());
    assert!(kernel.loaded_names().contains("containai-proxy-prod"));
    assert!(!h.root.join(".staging").join("1.2.0").exists());

    let events = read_events(h.audit.path()).expect("audit");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "install");
    assert_eq!(events[0].payload["version"], "1.2.0");
}

#[test]
fn upgrade_moves_old_release_to_previous() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let first = h.release("1.2.0", &pki, Attestation::Signed);
    let second = h.release("1.3.0", &pki, Attestation::Signed);

    h.run(&first, Channel::Prod, &pki.policy(), &kernel).expect("first");
    h.run(&second, Channel::Prod, &pki.policy(), &kernel).expect("second");

    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.3.0")));
    assert_eq!(
        std::fs::read_link(h.root.join("previous")).ok().as_deref(),
        Some(Path::new("releases/1.2.0"))
    );
    assert_eq!(h.releases(), ["1.2.0", "1.3.0"]);
}

#[test]
fn reinstalling_the_same_version_reuses_it() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);

    h.run(&fixture, Channel::Prod, &pki.policy(), &kernel).expect("first");
    let again = h
        .run(&fixture, Channel::Prod, &pki.policy(), &kernel)
        .expect("second");
    assert!(matches!(again, InstallOutcome::Installed { reused: true, .. }));
    assert!(!h.root.join("previous").exists());
}

#[test]
fn tampered_existing_release_is_not_reused() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&fixture, Channel::Prod, &pki.policy(), &kernel).expect("first");

    std::fs::write(h.root.join("releases/1.2.0/bin/containai"), b"#!/bin/sh\nevil\n")
        .expect("tamper");
    let err = h
        .run(&fixture, Channel::Prod, &pki.policy(), &kernel)
        .expect_err("tampered release");
    assert!(format!("{err:#}").contains("bin/containai"));
}

#[test]
fn corrupted_sums_entry_names_the_file_and_changes_nothing() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let good = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&good, Channel::Prod, &pki.policy(), &kernel).expect("baseline");

    let bad = h.release("1.3.0", &pki, Attestation::Signed);
    corrupt_sums_entry(&bad.dir, "payload.sbom.json");

    let err = h
        .run(&bad, Channel::Prod, &pki.policy(), &kernel)
        .expect_err("corrupted sums");
    assert!(format!("{err:#}").contains("payload.sbom.json"));
    assert_eq!(h.releases(), ["1.2.0"]);
    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));
}

#[test]
fn mismatched_sums_digest_is_rejected() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    std::fs::write(fixture.dir.join("SHA256SUMS"), "garbage\n").expect("overwrite");

    let err = h
        .run(&fixture, Channel::Prod, &pki.policy(), &FakeKernel::new())
        .expect_err("hash chain");
    assert!(format!("{err:#}").contains("SHA256SUMS digest mismatch"));
    assert!(h.releases().is_empty());
    assert!(h.current().is_none());
}

#[test]
fn failure_after_extraction_leaves_current_unchanged() {
    let h = Harness::new();
    let pki = Pki::github();
    let good = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&good, Channel::Prod, &pki.policy(), &FakeKernel::new())
        .expect("baseline");

    let next = h.release("1.3.0", &pki, Attestation::Signed);
    let err = h
        .run(&next, Channel::Prod, &pki.policy(), &FakeKernel::disabled())
        .expect_err("apparmor disabled");
    assert!(format!("{err:#}").contains("AppArmor"));
    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));
    assert_eq!(h.releases(), ["1.2.0"]);
    let staging = h.root.join(".staging");
    let leftovers = std::fs::read_dir(&staging).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn unattested_release_warns_on_dev() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::None);
    let unpinned = TrustPolicy {
        root_cert_sha256: String::new(),
        ..pki.policy()
    };

    let outcome = h
        .run(&fixture, Channel::Dev, &unpinned, &FakeKernel::new())
        .expect("dev install");
    assert!(matches!(
        outcome,
        InstallOutcome::Installed {
            attested: false,
            ..
        }
    ));
    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));
}

#[test]
fn placeholder_attestation_fails_on_prod() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::Placeholder);

    let err = h
        .run(&fixture, Channel::Prod, &pki.policy(), &FakeKernel::new())
        .expect_err("prod needs attestation");
    assert!(format!("{err:#}").contains("attestation"));
    assert!(h.releases().is_empty());
}

#[test]
fn missing_attestation_fails_on_nightly() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::None);

    assert!(h
        .run(&fixture, Channel::Nightly, &pki.policy(), &FakeKernel::new())
        .is_err());
    assert!(h.current().is_none());
}

#[test]
fn bad_attestation_stays_fatal_on_dev() {
    let h = Harness::new();
    let pki = Pki::github();
    let rogue = Pki::github();
    let fixture = h.release("1.2.0", &rogue, Attestation::Signed);
    std::fs::write(fixture.dir.join("tools/cosign-root.pem"), &pki.anchor_pem).expect("anchor");

    let err = h
        .run(&fixture, Channel::Dev, &pki.policy(), &FakeKernel::new())
        .expect_err("rogue signer");
    assert!(format!("{err:#}").contains("no attestation verifies"));
    assert!(h.releases().is_empty());
}

#[test]
fn self_integrity_failure_stops_everything() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    let fetcher = StaticFetcher::default();
    let kernel = FakeKernel::new();
    let trust = pki.policy();
    let deps = InstallDeps {
        fetcher: &fetcher,
        kernel: &kernel,
        audit: &h.audit,
        self_integrity: &FixedIntegrity(false),
        trust: &trust,
    };
    let request = InstallRequest::new(fixture.tag(), REPO)
        .with_asset_dir(&fixture.dir)
        .with_target(TARGET);

    let err = install(&context(&h.root, Channel::Prod), &request, &deps).expect_err("self");
    assert!(format!("{err:#}").contains("self-integrity"));
    assert!(!h.root.exists());
}

#[test]
fn verify_only_checks_current_release() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&fixture, Channel::Prod, &pki.policy(), &FakeKernel::new())
        .expect("install");
    let ctx = context(&h.root, Channel::Prod);

    let outcome = verify_current(&ctx).expect("verify");
    let InstallOutcome::Verified { files, .. } = outcome else {
        panic!("expected verification");
    };
    assert_eq!(files, 9);

    std::fs::write(h.root.join("releases/1.2.0/README.md"), b"changed\n").expect("tamper");
    let err = verify_current(&ctx).expect_err("tampered");
    assert!(format!("{err:#}").contains("README.md"));
}

#[test]
fn verify_only_without_install_fails() {
    let h = Harness::new();
    assert!(verify_current(&context(&h.root, Channel::Prod)).is_err());
}

#[test]
fn reuse_requires_the_bundle_sums_file() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let fixture = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&fixture, Channel::Prod, &pki.policy(), &kernel).expect("first");

    let release = h.root.join("releases/1.2.0");
    let evil = b"#!/bin/sh\nevil\n";
    std::fs::write(release.join("bin/containai"), evil).expect("tamper");
    let sums_path = release.join("SHA256SUMS");
    let sums: String = std::fs::read_to_string(&sums_path)
        .expect("sums")
        .lines()
        .map(|line| {
            if line.ends_with("bin/containai") {
                format!("{}  bin/containai\n", containai::integrity::sha256_bytes(evil))
            } else {
                format!("{line}\n")
            }
        })
        .collect();
    std::fs::write(&sums_path, sums).expect("rewrite sums");

    let err = h
        .run(&fixture, Channel::Prod, &pki.policy(), &kernel)
        .expect_err("rewritten sums");
    assert!(format!("{err:#}").contains("does not match the verified bundle"));
}

#[test]
fn rejected_release_never_reaches_the_kernel() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let good = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&good, Channel::Prod, &pki.policy(), &kernel).expect("baseline");
    let loads_before = kernel.load_paths();

    let bad = h.release("1.3.0", &pki, Attestation::Signed);
    corrupt_sums_entry(&bad.dir, "README.md");
    let err = h
        .run(&bad, Channel::Prod, &pki.policy(), &kernel)
        .expect_err("corrupted tree");
    assert!(format!("{err:#}").contains("README.md"));
    assert_eq!(kernel.load_paths(), loads_before);
    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));
}

#[test]
fn partial_load_failure_restores_current_profiles() {
    let h = Harness::new();
    let pki = Pki::github();
    let kernel = FakeKernel::new();
    let good = h.release("1.2.0", &pki, Attestation::Signed);
    h.run(&good, Channel::Prod, &pki.policy(), &kernel).expect("baseline");

    kernel.fail_at.set(Some(4));
    let next = h.release("1.3.0", &pki, Attestation::Signed);
    assert!(h.run(&next, Channel::Prod, &pki.policy(), &kernel).is_err());

    assert_eq!(h.current().as_deref(), Some(Path::new("releases/1.2.0")));
    assert_eq!(h.releases(), ["1.2.0"]);
    let loads = kernel.load_paths();
    let restored: Vec<_> = loads.iter().rev().take(3).collect();
    assert_eq!(restored.len(), 3);
    assert!(restored
        .iter()
        .all(|p| p.to_string_lossy().contains("releases/1.2.0")));
}

#[test]
fn unlisted_payload_file_is_rejected_on_dev() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = ReleaseFixture::write_with_unlisted(
        &h.assets.join("1.2.0"),
        "1.2.0",
        &pki,
        Attestation::None,
        &[("bin/extra".to_owned(), b"#!/bin/sh\n".to_vec())],
    );
    let unpinned = TrustPolicy {
        root_cert_sha256: String::new(),
        ..pki.policy()
    };

    let err = h
        .run(&fixture, Channel::Dev, &unpinned, &FakeKernel::new())
        .expect_err("unlisted file");
    assert!(format!("{err:#}").contains("bin/extra"));
    assert!(h.releases().is_empty());
    assert!(h.current().is_none());
}

#[test]
fn listed_payload_tarball_must_match() {
    let h = Harness::new();
    let pki = Pki::github();
    let fixture = h.release("1.2.0", &pki, Attestation::None);
    let sums_path = fixture.dir.join("SHA256SUMS");
    let mut sums = std::fs::read_to_string(&sums_path).expect("sums");
    sums.push_str(&format!("{}  payload.tar.gz\n", "1".repeat(64)));
    std::fs::write(&sums_path, &sums).expect("write sums");
    std::fs::write(
        fixture.dir.join("payload.sha256"),
        format!("{}  SHA256SUMS\n", containai::integrity::sha256_bytes(sums.as_bytes())),
    )
    .expect("rehash sums");
    let unpinned = TrustPolicy {
        root_cert_sha256: String::new(),
        ..pki.policy()
    };

    let err = h
        .run(&fixture, Channel::Dev, &unpinned, &FakeKernel::new())
        .expect_err("payload digest");
    assert!(format!("{err:#}").contains("payload.tar.gz digest mismatch"));
}
