//! Self-hash injection and verification on a stand-in executable.

use installer::self_check::{
    inject_self_hash, read_slot, redacted_sha256, verify_executable, ExecutableAt, SelfIntegrity,
    MARKER, PLACEHOLDER,
};

fn fake_binary(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("containai-install");
    let mut bytes = b"\x7fELF\x02\x01\x01\x00code code code\n".to_vec();
    bytes.extend_from_slice(format!("\n{MARKER}{PLACEHOLDER}\n").as_bytes());
    bytes.extend_from_slice(b"more code\x00\x01\x02 trailing data");
    std::fs::write(&path, bytes).expect("write binary");
    path
}

#[test]
fn injection_is_hash_neutral() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_binary(dir.path());
    let before = redacted_sha256(&std::fs::read(&path).expect("read"));

    let digest = inject_self_hash(&path).expect("inject");
    assert_eq!(digest, before);

    let data = std::fs::read(&path).expect("read");
    assert_eq!(read_slot(&data).as_deref(), Some(digest.as_str()));
    assert_eq!(redacted_sha256(&data), digest);
    verify_executable(&path, &digest).expect("verifies");
}

#[test]
fn modified_executable_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_binary(dir.path());
    let digest = inject_self_hash(&path).expect("inject");

    let mut data = std::fs::read(&path).expect("read");
    data[6] ^= 0x40;
    std::fs::write(&path, data).expect("tamper");

    let check = ExecutableAt {
        path: path.clone(),
        expected: digest,
    };
    let err = check.verify().expect_err("tampered");
    assert!(err.is_trust_failure());
    assert!(err.to_string().contains("has been modified"));
}

#[test]
fn uninjected_build_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_binary(dir.path());
    let slot = read_slot(&std::fs::read(&path).expect("read")).expect("slot");
    assert_eq!(slot, PLACEHOLDER);
    assert!(verify_executable(&path, &slot).is_err());
}

#[test]
fn binary_without_slot_cannot_be_injected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("plain");
    std::fs::write(&path, b"no slot here").expect("write");
    assert!(inject_self_hash(&path).is_err());
}

#[cfg(unix)]
#[test]
fn injection_keeps_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_binary(dir.path());
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    inject_self_hash(&path).expect("inject");
    let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}
