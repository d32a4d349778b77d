//! CLI smoke tests for hit.
//!
//! Each test runs against an isolated hashdist home created with
//! `hit init-home`, selected through HDIST_CONFIG.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Environment
// =============================================================================

/// Isolated hashdist home plus config selection for every command.
struct TestEnv {
    temp: TempDir,
    home: PathBuf,
}

impl TestEnv {
    /// Create and initialize an isolated home.
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("hashdist");
        let env = Self { temp, home };
        env.cmd().arg("init-home").arg(&env.home).assert().success();
        env
    }

    /// Get a Command for the hit binary pointed at the isolated home.
    fn cmd(&self) -> Command {
        let mut cmd: Command = cargo_bin_cmd!("hit");
        cmd.env("HDIST_CONFIG", self.home.join("config.yaml"));
        cmd.env("HOME", self.temp.path());
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// A spec with no commands: valid, hermetic, and instant to build.
fn empty_spec(name: &str, version: &str) -> String {
    format!(
        r#"{{"name": "{}", "version": "{}", "build": {{}}}}"#,
        name, version
    )
}

// =============================================================================
// Help & Version (no isolation needed)
// =============================================================================

fn hit_cmd() -> Command {
    cargo_bin_cmd!("hit")
}

#[test]
fn help_flag_works() {
    hit_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
    hit_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hit"));
}

#[test]
fn subcommand_help_works() {
    for cmd in &["build", "fetch", "gc", "make-profile", "resolve", "root"] {
        hit_cmd()
            .arg(cmd)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Usage"));
    }
}

#[test]
fn unknown_subcommand_exits_with_usage_code() {
    hit_cmd().arg("frobnicate").assert().failure().code(2);
}

// =============================================================================
// init-home
// =============================================================================

#[test]
fn init_home_creates_skeleton() {
    let env = TestEnv::new();
    assert!(env.home.join("config.yaml").is_file());
    assert!(env.home.join("store/opt").is_dir());
    assert!(env.home.join("store/bld").is_dir());
    assert!(env.home.join("source").is_dir());
    assert!(env.home.join("gcroots").is_dir());
}

#[test]
fn missing_config_fails_with_hint() {
    let temp = TempDir::new().unwrap();
    let mut cmd: Command = cargo_bin_cmd!("hit");
    cmd.env("HDIST_CONFIG", temp.path().join("nope.yaml"));
    cmd.arg("gc")
        .assert()
        .failure()
        .stderr(predicate::str::contains("init-home"));
}

// =============================================================================
// build / resolve / purge
// =============================================================================

#[test]
fn build_then_resolve_then_purge() {
    let env = TestEnv::new();
    let spec = env.write("build.json", &empty_spec("demo", "1.0"));

    let output = env.cmd().arg("build").arg(&spec).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let id = stdout
        .lines()
        .find(|l| l.starts_with("demo/1.0/"))
        .expect("build prints the artifact id")
        .to_string();

    // The artifact resolves, both by full and short id.
    env.cmd()
        .arg("resolve")
        .arg(&id)
        .assert()
        .success()
        .stdout(predicate::str::contains("store/opt/demo/1.0"));

    // Building again is a cache hit and prints the same id.
    env.cmd()
        .arg("build")
        .arg(&spec)
        .assert()
        .success()
        .stdout(predicate::str::contains(&id));

    env.cmd().arg("purge").arg(&id).assert().success();
    env.cmd().arg("resolve").arg(&id).assert().failure();
}

#[test]
fn build_rejects_invalid_spec() {
    let env = TestEnv::new();
    let spec = env.write("build.json", r#"{"version": "1.0", "build": {}}"#);
    env.cmd().arg("build").arg(&spec).assert().failure().code(2);
}

// =============================================================================
// source cache
// =============================================================================

#[test]
fn put_and_unpack_roundtrip() {
    let env = TestEnv::new();
    let src = env.temp.path().join("proj");
    std::fs::create_dir_all(src.join("sub")).unwrap();
    std::fs::write(src.join("sub/data.txt"), "payload").unwrap();

    let output = env.cmd().arg("put").arg(&src).output().unwrap();
    assert!(output.status.success());
    let key = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(key.starts_with("dir:"));

    let target = env.temp.path().join("out");
    env.cmd()
        .arg("unpack")
        .arg(&key)
        .arg(&target)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(target.join("sub/data.txt")).unwrap(),
        "payload"
    );
}

// =============================================================================
// profiles
// =============================================================================

#[test]
fn build_profile_is_cached_and_content_addressed() {
    let env = TestEnv::new();
    let spec = env.write("build.json", &empty_spec("lib", "1"));
    let output = env.cmd().arg("build").arg(&spec).output().unwrap();
    assert!(output.status.success());
    let id = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .find(|l| l.starts_with("lib/1/"))
        .unwrap()
        .to_string();

    let manifest = env.write("profile-manifest.json", &format!(r#"{{"artifacts": ["{}"]}}"#, id));

    let first = env
        .cmd()
        .arg("build-profile")
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(
        first.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&first.stderr)
    );
    let first_out = String::from_utf8(first.stdout).unwrap();
    let profile_id = first_out
        .lines()
        .find(|l| l.starts_with("profile/"))
        .expect("profile id printed")
        .to_string();

    // Rebuilding over the same artifact set is a cache hit on the same id.
    env.cmd()
        .arg("build-profile")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains(&profile_id));

    // The profile artifact carries the assembled manifest.
    let resolve = env.cmd().arg("resolve").arg(&profile_id).output().unwrap();
    let dir = String::from_utf8(resolve.stdout).unwrap().trim().to_string();
    let manifest_doc =
        std::fs::read_to_string(Path::new(&dir).join("profile.json")).unwrap();
    assert!(manifest_doc.contains(&id));
}

#[test]
fn make_profile_assembles_directly() {
    let env = TestEnv::new();
    let spec = env.write("build.json", &empty_spec("lib", "1"));
    let output = env.cmd().arg("build").arg(&spec).output().unwrap();
    let id = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .find(|l| l.starts_with("lib/1/"))
        .unwrap()
        .to_string();

    let target = env.temp.path().join("profile");
    env.cmd()
        .arg("make-profile")
        .arg(&target)
        .arg(&id)
        .assert()
        .success();
    assert!(target.join("profile.json").is_file());
}

// =============================================================================
// gc
// =============================================================================

#[test]
fn gc_dry_run_reports_unrooted_artifacts() {
    let env = TestEnv::new();
    let spec = env.write("build.json", &empty_spec("doomed", "1"));
    env.cmd().arg("build").arg(&spec).assert().success();

    env.cmd()
        .arg("gc")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Would remove 1 artifacts"));

    // Dry run deleted nothing.
    env.cmd()
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 artifacts"));
}

#[test]
fn rooted_artifact_survives_gc() {
    let env = TestEnv::new();
    let spec = env.write("build.json", &empty_spec("keeper", "1"));
    let output = env.cmd().arg("build").arg(&spec).output().unwrap();
    let id = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .find(|l| l.starts_with("keeper/1/"))
        .unwrap()
        .to_string();

    let link = env.temp.path().join("current");
    env.cmd()
        .arg("root")
        .arg("add")
        .arg(&id)
        .arg(&link)
        .assert()
        .success();

    env.cmd()
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 artifacts"));
    env.cmd().arg("resolve").arg(&id).assert().success();

    env.cmd().arg("root").arg("rm").arg(&link).assert().success();
    env.cmd()
        .arg("gc")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 artifacts"));
    env.cmd().arg("resolve").arg(&id).assert().failure();
}
