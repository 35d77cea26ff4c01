//! Shared fixtures: a throwaway Fulcio-like PKI, signed envelopes, release
//! bundles and in-memory collaborators.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, Issuer,
    KeyPair, SanType, PKCS_ECDSA_P256_SHA256,
};

use containai::config::{ContainaiConfig, Context};
use containai::error::{SecurityError, SecurityResult};
use containai::integrity::sha256_bytes;
use containai::kernel::PolicyKernel;
use containai::Channel;

use installer::bundle::AssetFetcher;
use installer::config::TrustPolicy;
use installer::dsse::{pae, INTOTO_PAYLOAD_TYPE};
use installer::self_check::SelfIntegrity;

pub const ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const IDENTITY: &str =
    "https://github.com/containai/containai/.github/workflows/release.yml@refs/tags/v1.2.0";
pub const IDENTITY_PREFIX: &str = "https://github.com/containai/containai/";
pub const ROOT_URL: &str = "https://trust.invalid/fulcio_v1.crt.pem";
pub const REPO: &str = "containai/containai";
pub const TARGET: &str = "x86_64-unknown-linux-gnu";

const FULCIO_ISSUER_ARCS: [u64; 9] = [1, 3, 6, 1, 4, 1, 57264, 1, 1];

fn named(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn ca_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = named(cn);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

fn new_key() -> KeyPair {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("generate key")
}

/// Root → intermediate → leaf, with the leaf's private key.
pub struct Pki {
    /// Root and intermediate, PEM, as the pinned bundle.
    pub anchor_pem: Vec<u8>,
    /// Root alone, PEM.
    pub root_pem: Vec<u8>,
    /// DER intermediate that issued the leaf.
    pub intermediate_der: Vec<u8>,
    /// DER leaf certificate.
    pub leaf_der: Vec<u8>,
    /// Key behind the leaf.
    pub signing_key: SigningKey,
}

impl Pki {
    /// Leaf carrying `issuer` in the Fulcio extension and `identity` as SAN URI.
    pub fn new(issuer: &str, identity: &str) -> Self {
        let root_key = new_key();
        let root_params = ca_params("containai test root");
        let root = root_params.clone().self_signed(&root_key).expect("root");

        let intermediate_key = new_key();
        let intermediate_params = ca_params("containai test intermediate");
        let root_issuer = Issuer::from_params(&root_params, &root_key);
        let intermediate = intermediate_params
            .clone()
            .signed_by(&intermediate_key, &root_issuer)
            .expect("intermediate");

        let leaf_key = new_key();
        let mut leaf_params = CertificateParams::default();
        leaf_params.distinguished_name = named("sigstore");
        leaf_params.subject_alt_names =
            vec![SanType::URI(identity.try_into().expect("ia5 identity"))];
        leaf_params
            .custom_extensions
            .push(CustomExtension::from_oid_content(
                &FULCIO_ISSUER_ARCS,
                issuer.as_bytes().to_vec(),
            ));
        let intermediate_issuer = Issuer::from_params(&intermediate_params, &intermediate_key);
        let leaf = leaf_params
            .signed_by(&leaf_key, &intermediate_issuer)
            .expect("leaf");

        let signing_key =
            SigningKey::from_pkcs8_der(&leaf_key.serialize_der()).expect("leaf signing key");
        let anchor_pem = format!("{}{}", root.pem(), intermediate.pem()).into_bytes();
        Self {
            anchor_pem,
            root_pem: root.pem().into_bytes(),
            intermediate_der: intermediate.der().to_vec(),
            leaf_der: leaf.der().to_vec(),
            signing_key,
        }
    }

    /// PKI with the default issuer and identity.
    pub fn github() -> Self {
        Self::new(ISSUER, IDENTITY)
    }

    /// Trust policy pinning this PKI's bundle.
    pub fn policy(&self) -> TrustPolicy {
        TrustPolicy {
            root_cert_url: ROOT_URL.to_owned(),
            root_cert_sha256: sha256_bytes(&self.anchor_pem),
            oidc_issuer: ISSUER.to_owned(),
            identity_prefix: Some(IDENTITY_PREFIX.to_owned()),
        }
    }

    /// Sign `payload` and return the JSON envelope line.
    pub fn envelope_line(&self, payload: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(&pae(INTOTO_PAYLOAD_TYPE, payload));
        serde_json::json!({
            "payloadType": INTOTO_PAYLOAD_TYPE,
            "payload": STANDARD.encode(payload),
            "signatures": [{
                "sig": STANDARD.encode(signature.to_der().as_bytes()),
                "cert": STANDARD.encode(&self.leaf_der),
            }],
        })
        .to_string()
    }
}

/// in-toto statement over `(name, sha256)` subjects.
pub fn statement(subjects: &[(&str, &str)]) -> Vec<u8> {
    let subject: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(name, digest)| serde_json::json!({"name": name, "digest": {"sha256": digest}}))
        .collect();
    serde_json::json!({
        "_type": "https://in-toto.io/Statement/v1",
        "subject": subject,
        "predicateType": "https://slsa.dev/provenance/v1",
        "predicate": {},
    })
    .to_string()
    .into_bytes()
}

/// Serves fixed bodies; everything else is a transport failure.
#[derive(Default)]
pub struct StaticFetcher {
    bodies: HashMap<String, Vec<u8>>,
    requests: RefCell<Vec<String>>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_owned(), body);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl AssetFetcher for StaticFetcher {
    fn fetch(&self, url: &str) -> SecurityResult<Vec<u8>> {
        self.requests.borrow_mut().push(url.to_owned());
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| SecurityError::config(format!("download of {url} failed: offline")))
    }
}

/// Self-check double.
pub struct FixedIntegrity(pub bool);

impl SelfIntegrity for FixedIntegrity {
    fn verify(&self) -> SecurityResult<()> {
        if self.0 {
            Ok(())
        } else {
            Err(SecurityError::trust("installer has been modified"))
        }
    }
}

/// Policy kernel double.
pub struct FakeKernel {
    pub enabled: bool,
    /// Fail the load with this index (counting every load so far), once.
    pub fail_at: Cell<Option<usize>>,
    loaded: RefCell<BTreeSet<String>>,
    loads: RefCell<Vec<PathBuf>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            enabled: true,
            fail_at: Cell::new(None),
            loaded: RefCell::new(BTreeSet::new()),
            loads: RefCell::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn loaded_names(&self) -> BTreeSet<String> {
        self.loaded.borrow().clone()
    }

    /// Every successfully loaded profile path, in order.
    pub fn load_paths(&self) -> Vec<PathBuf> {
        self.loads.borrow().clone()
    }
}

impl PolicyKernel for FakeKernel {
    fn apparmor_enabled(&self) -> bool {
        self.enabled
    }

    fn loaded_profiles(&self) -> Option<BTreeSet<String>> {
        Some(self.loaded.borrow().clone())
    }

    fn loader_available(&self) -> bool {
        true
    }

    fn load_profile(&self, path: &Path) -> SecurityResult<()> {
        if self.fail_at.get() == Some(self.loads.borrow().len()) {
            self.fail_at.set(None);
            return Err(SecurityError::config(format!(
                "apparmor_parser rejected {}",
                path.display()
            )));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("apparmor-"))
            .ok_or_else(|| SecurityError::config("unexpected profile path"))?
            .to_owned();
        self.loaded.borrow_mut().insert(name);
        self.loads.borrow_mut().push(path.to_path_buf());
        Ok(())
    }
}

pub fn context(root: &Path, channel: Channel) -> Context {
    Context::new(root, channel, ContainaiConfig::default()).with_privileged(true)
}

/// Gzipped tar of `(path, bytes)` entries.
pub fn tar_gz(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(u64::try_from(bytes.len()).expect("entry size"));
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, bytes.as_slice())
            .expect("append");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

fn payload_entries() -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![
        ("bin/containai".to_owned(), b"#!/bin/sh\necho containai\n".to_vec()),
        ("README.md".to_owned(), b"ContainAI\n".to_vec()),
    ];
    for base in containai::profiles::REQUIRED_BASES {
        entries.push((
            format!("host/templates/apparmor/{base}.profile"),
            format!("profile {base} {{\n  signal (receive) peer={base},\n}}\n").into_bytes(),
        ));
        entries.push((
            format!("host/templates/seccomp/{base}.json"),
            b"{\"defaultAction\": \"SCMP_ACT_ERRNO\"}\n".to_vec(),
        ));
    }
    entries
}

/// How the fixture's attestation file looks.
pub enum Attestation {
    /// Signed by the given PKI.
    Signed,
    /// No attestation file.
    None,
    /// `{}` placeholder.
    Placeholder,
}

/// A release laid out as loose bundle members.
pub struct ReleaseFixture {
    pub dir: PathBuf,
    pub version: String,
    pub payload_sha256: String,
    pub sbom_sha256: String,
}

impl ReleaseFixture {
    /// Write a complete release for `version` into `dir`.
    pub fn write(dir: &Path, version: &str, pki: &Pki, attestation: Attestation) -> Self {
        Self::write_with_unlisted(dir, version, pki, attestation, &[])
    }

    /// Like [`ReleaseFixture::write`], with `unlisted` added to the payload
    /// but left out of `SHA256SUMS`.
    pub fn write_with_unlisted(
        dir: &Path,
        version: &str,
        pki: &Pki,
        attestation: Attestation,
        unlisted: &[(String, Vec<u8>)],
    ) -> Self {
        std::fs::create_dir_all(dir.join("tools")).expect("tools dir");
        let entries = payload_entries();
        let mut archived = entries.clone();
        archived.extend_from_slice(unlisted);
        let payload = tar_gz(&archived);
        let sbom = format!("{{\"bomFormat\":\"CycloneDX\",\"version\":\"{version}\"}}\n");

        let mut sums = String::new();
        for (path, bytes) in &entries {
            sums.push_str(&format!("{}  {path}\n", sha256_bytes(bytes)));
        }
        sums.push_str(&format!("{}  payload.sbom.json\n", sha256_bytes(sbom.as_bytes())));

        std::fs::write(dir.join("payload.tar.gz"), &payload).expect("payload");
        std::fs::write(dir.join("payload.sbom.json"), &sbom).expect("sbom");
        std::fs::write(dir.join("SHA256SUMS"), &sums).expect("sums");
        std::fs::write(
            dir.join("payload.sha256"),
            format!("{}  SHA256SUMS\n", sha256_bytes(sums.as_bytes())),
        )
        .expect("payload.sha256");
        std::fs::write(dir.join("tools/cosign-root.pem"), &pki.anchor_pem).expect("anchor");

        let payload_sha256 = sha256_bytes(&payload);
        let sbom_sha256 = sha256_bytes(sbom.as_bytes());
        let attestations = dir.join("payload.intoto.jsonl");
        match attestation {
            Attestation::Signed => {
                let line = pki.envelope_line(&statement(&[
                    ("payload.tar.gz", &payload_sha256),
                    ("payload.sbom.json", &sbom_sha256),
                ]));
                std::fs::write(&attestations, format!("{line}\n")).expect("attestation");
            }
            Attestation::Placeholder => {
                std::fs::write(&attestations, "{}\n").expect("placeholder");
            }
            Attestation::None => {}
        }

        Self {
            dir: dir.to_path_buf(),
            version: version.to_owned(),
            payload_sha256,
            sbom_sha256,
        }
    }

    pub fn tag(&self) -> String {
        format!("v{}", self.version)
    }
}
