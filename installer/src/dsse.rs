//! DSSE / in-toto attestation verification.
//!
//! Each release artifact (payload tarball, SBOM) must be covered by an
//! in-toto statement wrapped in a DSSE envelope and signed by a short-lived
//! certificate that chains to the pinned root. Verification runs in-process:
//!
//! 1. parse the envelope (plain DSSE line or Sigstore bundle line);
//! 2. walk the signing certificate up to a self-signed root in the anchor;
//! 3. take the leaf's P-256 key and check the signature over the PAE;
//! 4. parse the statement and bind a subject to the artifact digest;
//! 5. check the OIDC issuer and, if pinned, the signer identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::Deserialize;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::der::parse_der_utf8string;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

use containai::error::{SecurityError, SecurityResult};

use crate::anchor::TrustAnchor;
use crate::config::TrustPolicy;

/// Payload type of an in-toto statement.
pub const INTOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Prefix shared by every in-toto statement `_type`.
const STATEMENT_TYPE_PREFIX: &str = "https://in-toto.io/Statement/";

/// Fulcio OIDC issuer extension (raw string value).
pub const FULCIO_ISSUER_OID: &str = "1.3.6.1.4.1.57264.1.1";
/// Fulcio OIDC issuer extension (DER `UTF8String` value).
pub const FULCIO_ISSUER_V2_OID: &str = "1.3.6.1.4.1.57264.1.8";

const MAX_CHAIN_DEPTH: usize = 4;

/// A decoded DSSE envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Declared payload media type.
    pub payload_type: String,
    /// Decoded payload bytes.
    pub payload: Vec<u8>,
    /// Signatures with their certificates.
    pub signatures: Vec<EnvelopeSignature>,
    /// Untrusted intermediates shipped with a Sigstore bundle; a chain may
    /// pass through them but must still end at a pinned root.
    pub intermediates: Vec<Vec<u8>>,
}

/// One signature and the DER certificate that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeSignature {
    /// Raw signature bytes (DER or fixed-size).
    pub sig: Vec<u8>,
    /// DER leaf certificate, when present.
    pub certificate: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    payload: String,
    payload_type: String,
    signatures: Vec<RawSignature>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignature {
    sig: String,
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    raw_bytes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    dsse_envelope: RawEnvelope,
    #[serde(default)]
    verification_material: Option<VerificationMaterial>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMaterial {
    #[serde(default)]
    certificate: Option<RawCertificate>,
    #[serde(default)]
    x509_certificate_chain: Option<RawChain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
struct RawChain {
    certificates: Vec<RawCertificate>,
}

/// in-toto statement (the fields verification needs).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Statement {
    /// Statement type URI.
    #[serde(rename = "_type")]
    pub statement_type: String,
    /// Artifacts the statement is about.
    pub subject: Vec<Subject>,
    /// Predicate type URI.
    #[serde(rename = "predicateType", default)]
    pub predicate_type: String,
}

/// One attested artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subject {
    /// Artifact name.
    #[serde(default)]
    pub name: String,
    /// Algorithm → hex digest.
    pub digest: BTreeMap<String, String>,
}

/// What a statement must say about the artifact.
#[derive(Debug, Clone, Copy)]
pub struct SubjectExpectation<'a> {
    /// SHA-256 of the artifact.
    pub sha256: &'a str,
    /// Required suffix of the subject name, if any.
    pub name_suffix: Option<&'a str>,
}

/// A successfully verified attestation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAttestation {
    /// Name of the matching subject.
    pub subject_name: String,
    /// OIDC issuer found on the signing certificate.
    pub issuer: String,
    /// First SAN URI of the signing certificate.
    pub identity: Option<String>,
}

/// Attestation lines gathered from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationSet {
    /// No attestation files, or only blank ones.
    Missing,
    /// Only placeholder objects (no envelope anywhere).
    Placeholder,
    /// Lines that claim to be envelopes.
    Present(Vec<AttestationLine>),
}

/// One candidate envelope line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationLine {
    /// `<file>:<line>` for error messages.
    pub origin: String,
    /// Line text.
    pub text: String,
}

/// Read every attestation file and classify the contents.
///
/// # Errors
///
/// Returns an error if a file cannot be read.
pub fn load_attestations(paths: &[PathBuf]) -> SecurityResult<AttestationSet> {
    let mut lines = Vec::new();
    let mut placeholders: usize = 0;
    for path in paths {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::io("failed to read attestation", path, e))?;
        for (idx, text) in content.lines().enumerate() {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if is_placeholder(text) {
                placeholders = placeholders.saturating_add(1);
                continue;
            }
            lines.push(AttestationLine {
                origin: format!("{}:{}", display_name(path), idx.saturating_add(1)),
                text: text.to_owned(),
            });
        }
    }
    Ok(match (lines.is_empty(), placeholders) {
        (false, _) => AttestationSet::Present(lines),
        (true, 0) => AttestationSet::Missing,
        (true, _) => AttestationSet::Placeholder,
    })
}

fn is_placeholder(text: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => {
            !map.contains_key("payload") && !map.contains_key("dsseEnvelope")
        }
        _ => false,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Find a line that verifies for `expect`.
///
/// # Errors
///
/// Returns [`SecurityError::TrustVerification`] listing why each line
/// failed when none verifies.
pub fn verify_subject(
    lines: &[AttestationLine],
    anchor: &TrustAnchor,
    policy: &TrustPolicy,
    expect: SubjectExpectation<'_>,
) -> SecurityResult<VerifiedAttestation> {
    let mut failures = Vec::new();
    for line in lines {
        let result = parse_envelope_line(&line.text)
            .and_then(|envelope| verify_envelope(&envelope, anchor, policy, expect));
        match result {
            Ok(verified) => {
                info!(
                    origin = %line.origin,
                    subject = %verified.subject_name,
                    issuer = %verified.issuer,
                    "attestation verified"
                );
                return Ok(verified);
            }
            Err(e) => {
                debug!(origin = %line.origin, error = %e, "attestation line rejected");
                failures.push(format!("{}: {e}", line.origin));
            }
        }
    }
    let what = expect.name_suffix.unwrap_or(expect.sha256);
    Err(SecurityError::trust(format!(
        "no attestation verifies {what}: {}",
        failures.join("; ")
    )))
}

/// Parse a DSSE envelope line or a Sigstore bundle line.
///
/// # Errors
///
/// Returns [`SecurityError::TrustVerification`] on malformed JSON or
/// encodings.
pub fn parse_envelope_line(line: &str) -> SecurityResult<Envelope> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| SecurityError::trust(format!("attestation is not JSON: {e}")))?;

    let (raw, material) = if value.get("dsseEnvelope").is_some() {
        let bundle: RawBundle = serde_json::from_value(value)
            .map_err(|e| SecurityError::trust(format!("malformed Sigstore bundle: {e}")))?;
        (bundle.dsse_envelope, bundle.verification_material)
    } else {
        let envelope: RawEnvelope = serde_json::from_value(value)
            .map_err(|e| SecurityError::trust(format!("malformed DSSE envelope: {e}")))?;
        (envelope, None)
    };

    let (bundle_cert, intermediates) = match material {
        Some(VerificationMaterial {
            certificate: Some(cert),
            ..
        }) => (Some(decode_certificate(&cert.raw_bytes)?), Vec::new()),
        Some(VerificationMaterial {
            x509_certificate_chain: Some(chain),
            ..
        }) => {
            let mut decoded = chain
                .certificates
                .iter()
                .map(|c| decode_certificate(&c.raw_bytes))
                .collect::<SecurityResult<Vec<_>>>()?
                .into_iter();
            (decoded.next(), decoded.collect())
        }
        _ => (None, Vec::new()),
    };

    let payload = decode_base64(&raw.payload, "payload")?;
    let mut signatures = Vec::with_capacity(raw.signatures.len());
    for signature in raw.signatures {
        let sig = decode_base64(&signature.sig, "signature")?;
        let certificate = match signature.cert.as_deref().or(signature.raw_bytes.as_deref()) {
            Some(encoded) => Some(decode_certificate(encoded)?),
            None => bundle_cert.clone(),
        };
        signatures.push(EnvelopeSignature { sig, certificate });
    }
    if signatures.is_empty() {
        return Err(SecurityError::trust("DSSE envelope carries no signatures"));
    }

    Ok(Envelope {
        payload_type: raw.payload_type,
        payload,
        signatures,
        intermediates,
    })
}

fn decode_base64(value: &str, what: &str) -> SecurityResult<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .or_else(|_| URL_SAFE.decode(value.trim()))
        .map_err(|e| SecurityError::trust(format!("{what} is not valid base64: {e}")))
}

/// Accept PEM text, base64 PEM, or base64 DER; return DER.
fn decode_certificate(encoded: &str) -> SecurityResult<Vec<u8>> {
    let trimmed = encoded.trim();
    let bytes = if trimmed.starts_with("-----BEGIN") {
        trimmed.as_bytes().to_vec()
    } else {
        decode_base64(trimmed, "certificate")?
    };
    if bytes.starts_with(b"-----BEGIN") {
        let pem = Pem::iter_from_buffer(&bytes)
            .next()
            .ok_or_else(|| SecurityError::trust("empty certificate PEM"))?
            .map_err(|e| SecurityError::trust(format!("malformed certificate PEM: {e}")))?;
        return Ok(pem.contents);
    }
    Ok(bytes)
}

/// DSSE pre-authentication encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "DSSEv1 {} {payload_type} {} ",
        payload_type.len(),
        payload.len()
    );
    let mut out = Vec::with_capacity(header.len().saturating_add(payload.len()));
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verify one envelope completely.
///
/// # Errors
///
/// Returns [`SecurityError::TrustVerification`] naming the first check
/// that failed.
pub fn verify_envelope(
    envelope: &Envelope,
    anchor: &TrustAnchor,
    policy: &TrustPolicy,
    expect: SubjectExpectation<'_>,
) -> SecurityResult<VerifiedAttestation> {
    if envelope.payload_type != INTOTO_PAYLOAD_TYPE {
        return Err(SecurityError::trust(format!(
            "unexpected payload type {:?}",
            envelope.payload_type
        )));
    }
    let message = pae(&envelope.payload_type, &envelope.payload);

    let mut last_error = SecurityError::trust("no signature carries a certificate");
    let mut signer: Option<&[u8]> = None;
    for signature in &envelope.signatures {
        let Some(cert_der) = signature.certificate.as_deref() else {
            continue;
        };
        match verify_signature(
            cert_der,
            &envelope.intermediates,
            anchor,
            &message,
            &signature.sig,
        ) {
            Ok(()) => {
                signer = Some(cert_der);
                break;
            }
            Err(e) => last_error = e,
        }
    }
    let Some(cert_der) = signer else {
        return Err(last_error);
    };

    let statement: Statement = serde_json::from_slice(&envelope.payload)
        .map_err(|e| SecurityError::trust(format!("payload is not an in-toto statement: {e}")))?;
    if !statement.statement_type.starts_with(STATEMENT_TYPE_PREFIX) {
        return Err(SecurityError::trust(format!(
            "unexpected statement type {:?}",
            statement.statement_type
        )));
    }
    let subject_name = bind_subject(&statement, expect)?;

    let (_, leaf) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| SecurityError::trust(format!("unparseable signing certificate: {e}")))?;
    let identities = CertificateIdentities::from_certificate(&leaf)?;
    let issuer = identities.require_issuer(&policy.oidc_issuer)?;
    if let Some(prefix) = policy.identity_prefix.as_deref() {
        identities.require_identity_prefix(prefix)?;
    }

    Ok(VerifiedAttestation {
        subject_name,
        issuer,
        identity: identities.uris.first().cloned(),
    })
}

fn verify_signature(
    cert_der: &[u8],
    intermediates: &[Vec<u8>],
    anchor: &TrustAnchor,
    message: &[u8],
    sig: &[u8],
) -> SecurityResult<()> {
    verify_chain(cert_der, intermediates, anchor)?;
    let (_, leaf) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| SecurityError::trust(format!("unparseable signing certificate: {e}")))?;

    let key = VerifyingKey::from_sec1_bytes(&leaf.public_key().subject_public_key.data)
        .map_err(|_| SecurityError::trust("signing certificate key is not ECDSA P-256"))?;
    let signature = Signature::from_der(sig)
        .or_else(|_| Signature::from_slice(sig))
        .map_err(|_| SecurityError::trust("signature is neither DER nor fixed-size ECDSA"))?;
    key.verify(message, &signature)
        .map_err(|_| SecurityError::trust("DSSE signature does not verify over the PAE"))
}

struct ChainCandidate<'a> {
    der: &'a [u8],
    cert: X509Certificate<'a>,
    pinned: bool,
}

/// Walk from the leaf certificate to a self-signed root in the anchor.
///
/// Issuers are looked up among the pinned certificates first, then among
/// `intermediates`. An unpinned certificate can link the chain but never
/// terminate it. Revocation is not checked, and neither is the leaf's
/// validity window: signing certificates live for minutes and are judged
/// at signing time.
///
/// # Errors
///
/// Returns [`SecurityError::TrustVerification`] if the chain breaks.
pub fn verify_chain(
    leaf_der: &[u8],
    intermediates: &[Vec<u8>],
    anchor: &TrustAnchor,
) -> SecurityResult<()> {
    let mut candidates = Vec::new();
    for (ders, pinned) in [(anchor.certificates(), true), (intermediates, false)] {
        for der in ders {
            let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| {
                SecurityError::trust(format!("unparseable {} certificate: {e}", origin(pinned)))
            })?;
            candidates.push(ChainCandidate {
                der: der.as_slice(),
                cert,
                pinned,
            });
        }
    }

    let mut current_der = leaf_der;
    for depth in 0..MAX_CHAIN_DEPTH {
        let (_, current) = x509_parser::parse_x509_certificate(current_der)
            .map_err(|e| SecurityError::trust(format!("unparseable certificate: {e}")))?;
        if depth == 0 && current.is_ca() {
            return Err(SecurityError::trust("signing certificate is a CA certificate"));
        }

        let found = candidates.iter().find(|candidate| {
            candidate.cert.subject().as_raw() == current.issuer().as_raw()
                && current
                    .verify_signature(Some(candidate.cert.public_key()))
                    .is_ok()
        });
        let Some(issuer) = found else {
            return Err(SecurityError::trust(format!(
                "certificate for {} issued by {} does not chain to the pinned root",
                current.subject(),
                current.issuer()
            )));
        };
        let cert = &issuer.cert;
        if !cert.is_ca() {
            return Err(SecurityError::trust(format!(
                "{} certificate {} is not a CA",
                origin(issuer.pinned),
                cert.subject()
            )));
        }
        if !cert.validity().is_valid() {
            return Err(SecurityError::trust(format!(
                "{} certificate {} is outside its validity window",
                origin(issuer.pinned),
                cert.subject()
            )));
        }
        if cert.subject().as_raw() == cert.issuer().as_raw() {
            if !issuer.pinned {
                return Err(SecurityError::trust(format!(
                    "chain ends at {}, which is not the pinned root",
                    cert.subject()
                )));
            }
            cert.verify_signature(None).map_err(|_| {
                SecurityError::trust(format!(
                    "pinned root {} is not validly self-signed",
                    cert.subject()
                ))
            })?;
            return Ok(());
        }
        current_der = issuer.der;
    }
    Err(SecurityError::trust("certificate chain is too long"))
}

fn origin(pinned: bool) -> &'static str {
    if pinned {
        "pinned"
    } else {
        "bundled"
    }
}

fn bind_subject(statement: &Statement, expect: SubjectExpectation<'_>) -> SecurityResult<String> {
    let matched = statement.subject.iter().find(|s| {
        let digest_ok = s
            .digest
            .get("sha256")
            .is_some_and(|d| d.eq_ignore_ascii_case(expect.sha256));
        let name_ok = expect.name_suffix.map_or(true, |suffix| s.name.ends_with(suffix));
        digest_ok && name_ok
    });
    match matched {
        Some(subject) => Ok(subject.name.clone()),
        None => {
            let listed: Vec<String> = statement
                .subject
                .iter()
                .map(|s| {
                    format!(
                        "{} ({})",
                        s.name,
                        s.digest.get("sha256").map_or("no sha256", String::as_str)
                    )
                })
                .collect();
            Err(SecurityError::trust(format!(
                "statement subjects [{}] do not include {} with sha256 {}",
                listed.join(", "),
                expect.name_suffix.unwrap_or("the artifact"),
                expect.sha256
            )))
        }
    }
}

/// Identity claims on a signing certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateIdentities {
    /// SAN URIs.
    pub uris: Vec<String>,
    /// SAN e-mail addresses.
    pub emails: Vec<String>,
    /// Values of the Fulcio issuer extensions.
    pub issuers: Vec<String>,
}

impl CertificateIdentities {
    /// Collect SAN entries and Fulcio issuer extensions.
    ///
    /// # Errors
    ///
    /// Returns an error when the SAN extension is malformed.
    pub fn from_certificate(cert: &X509Certificate<'_>) -> SecurityResult<Self> {
        let mut identities = Self::default();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| SecurityError::trust(format!("malformed subjectAltName: {e}")))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::URI(uri) => identities.uris.push((*uri).to_owned()),
                    GeneralName::RFC822Name(email) => identities.emails.push((*email).to_owned()),
                    _ => {}
                }
            }
        }
        for ext in cert.extensions() {
            let oid = ext.oid.to_id_string();
            let value = if oid == FULCIO_ISSUER_OID {
                std::str::from_utf8(ext.value).ok().map(str::to_owned)
            } else if oid == FULCIO_ISSUER_V2_OID {
                der_utf8_string(ext.value)
            } else {
                None
            };
            if let Some(value) = value {
                identities.issuers.push(value);
            }
        }
        Ok(identities)
    }

    fn require_issuer(&self, expected: &str) -> SecurityResult<String> {
        let found = self
            .issuers
            .iter()
            .chain(&self.uris)
            .chain(&self.emails)
            .any(|v| v == expected);
        if found {
            Ok(expected.to_owned())
        } else {
            Err(SecurityError::trust(format!(
                "signing certificate does not reference OIDC issuer {expected} (found {:?})",
                self.issuers
            )))
        }
    }

    fn require_identity_prefix(&self, prefix: &str) -> SecurityResult<()> {
        if self.uris.iter().any(|u| u.starts_with(prefix)) {
            Ok(())
        } else {
            Err(SecurityError::trust(format!(
                "signer identity {:?} does not start with {prefix}",
                self.uris
            )))
        }
    }
}

/// Decode a DER `UTF8String`.
fn der_utf8_string(bytes: &[u8]) -> Option<String> {
    let (_, object) = parse_der_utf8string(bytes).ok()?;
    object.as_str().ok().map(str::to_owned)
}
