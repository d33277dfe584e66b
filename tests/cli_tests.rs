//! Binary-level tests: argument surface and exit-code mapping.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn tbc_export() -> Command {
    Command::cargo_bin("tbc-export").unwrap()
}

/// CVBS capture with a minimal sidecar, enough to pass input detection.
fn write_capture(dir: &std::path::Path) -> PathBuf {
    let tbc = dir.join("tape.tbc");
    std::fs::write(&tbc, b"tbc-data").unwrap();
    std::fs::write(
        dir.join("tape.tbc.json"),
        r#"{"videoParameters": {"numberOfSequentialFields": 1000,
            "sampleRate": 17734375, "system": "PAL"}}"#,
    )
    .unwrap();
    tbc
}

#[test]
fn list_profiles_needs_no_input() {
    tbc_export()
        .arg("--list-profiles")
        .assert()
        .success()
        .stdout(predicate::str::contains("ffv1"))
        .stdout(predicate::str::contains("x264_web"));
}

#[test]
fn missing_input_file_is_a_configuration_error() {
    tbc_export()
        .arg("/no/such/capture.tbc")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not found"));
}

#[test]
fn unknown_profile_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let tbc = write_capture(dir.path());

    tbc_export()
        .arg(&tbc)
        .args(["--profile", "nonexistent", "--dry-run"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("unknown profile"));
}

#[test]
fn dry_run_prints_commands_without_launching() {
    let dir = tempfile::tempdir().unwrap();
    let tbc = write_capture(dir.path());

    tbc_export()
        .arg(&tbc)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("ld-chroma-decoder"))
        .stdout(predicate::str::contains("ffmpeg"));
}

#[test]
fn malformed_checksum_expectation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tbc = write_capture(dir.path());

    tbc_export()
        .arg(&tbc)
        .args(["--expect-checksum", "not-a-pair", "--dry-run"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("--expect-checksum"));
}
