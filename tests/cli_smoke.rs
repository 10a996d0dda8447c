//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use predicates::prelude::*;
use tempfile::TempDir;

const DOCUMENT: &str = r#"{ "name": "web-1", "image_id": "img-1", "flavor_id": "flv-1" }"#;

/// Builds a command isolated from the caller's configuration files and
/// cloud credentials, running inside `dir`.
fn stratus_in(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("stratus");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path())
        .env_remove("STRATUS_CONFIG_PATH")
        .env_remove("OS_AUTH_TOKEN")
        .env_remove("OS_COMPUTE_ENDPOINT")
        .env_remove("OS_IMAGE_ENDPOINT")
        .env_remove("OS_NETWORK_ENDPOINT")
        .env_remove("OS_VOLUME_ENDPOINT");
    cmd
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

fn write_document(dir: &TempDir, name: &str, contents: &str) {
    let root = Utf8Path::from_path(dir.path())
        .unwrap_or_else(|| panic!("temp dir should be utf8: {}", dir.path().display()));
    Dir::open_ambient_dir(root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write(name, contents)
        .unwrap_or_else(|err| panic!("write {name}: {err}"));
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("stratus");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn create_reports_missing_document() {
    let dir = temp_dir();

    stratus_in(&dir)
        .args(["create", "--file", "missing.json"])
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("failed to read instance document"));
}

#[test]
fn create_reports_invalid_document() {
    let dir = temp_dir();
    write_document(&dir, "web.json", r#"{ "name": 42 }"#);

    stratus_in(&dir)
        .args(["create", "-f", "web.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid instance document"));
}

#[test]
fn create_requires_api_token() {
    let dir = temp_dir();
    write_document(&dir, "web.json", DOCUMENT);

    stratus_in(&dir)
        .args(["create", "-f", "web.json"])
        .env("OS_COMPUTE_ENDPOINT", "https://compute.invalid/v2.1")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("OS_AUTH_TOKEN"));
}

#[test]
fn create_rejects_endpoint_without_scheme() {
    let dir = temp_dir();
    write_document(&dir, "web.json", DOCUMENT);

    stratus_in(&dir)
        .args(["create", "-f", "web.json"])
        .env("OS_AUTH_TOKEN", "tok")
        .env("OS_COMPUTE_ENDPOINT", "compute.invalid")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must be an http:// or https:// URL"));
}
