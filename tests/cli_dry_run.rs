//! Behavioural tests for the `kiln` CLI entrypoint.

use std::fs;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::{contains, ends_with, starts_with};
use tempfile::TempDir;

const REQUIRED: [(&str, &str); 4] = [
    ("KILN_BUILD_SUBNET_ID", "pn-123"),
    ("KILN_BUILD_IMAGE_ID", "img-456"),
    ("KILN_BUILD_SECURITY_GROUP_ID", "sg-789"),
    ("KILN_BUILD_INSTANCE_PROFILE", "project-abc"),
];

fn workspace() -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    let root = dir.path();
    fs::create_dir_all(root.join("scripts/build")).expect("script folder");
    fs::write(root.join("scripts/build/main.sh"), "echo 'building'\n").expect("main.sh");
    fs::write(root.join("config.sh"), "export APP=frontend\n").expect("config.sh");
    fs::write(root.join("repo.sh"), "git pull\n").expect("repo.sh");
    dir
}

fn kiln_in(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path())
        .env("RUST_LOG", "off")
        .env("KILN_BUILD_CONFIG_FILE", dir.path().join("config.sh"))
        .env("KILN_BUILD_REPO_FILE", dir.path().join("repo.sh"));
    cmd
}

#[test]
fn dry_run_prints_the_provisioning_script() {
    let dir = workspace();
    let mut cmd = kiln_in(&dir);
    cmd.envs(REQUIRED).arg("--dry-run");

    cmd.assert()
        .success()
        .stdout(starts_with("cd /usr/local/src\nmkdir -p bootstrap\n"))
        .stdout(contains("bootstrap/config.sh"))
        .stdout(ends_with("bash main.sh\n"))
        .stderr("");
}

#[test]
fn dry_run_reports_missing_settings() {
    let dir = workspace();
    let mut cmd = kiln_in(&dir);
    cmd.envs(REQUIRED)
        .env("KILN_BUILD_SUBNET_ID", "  ")
        .arg("--dry-run");

    cmd.assert()
        .failure()
        .code(1)
        .stdout("")
        .stderr(contains("KILN_BUILD_SUBNET_ID"));
}

#[test]
fn dry_run_reports_a_missing_script_folder() {
    let dir = workspace();
    let mut cmd = kiln_in(&dir);
    cmd.envs(REQUIRED)
        .env("KILN_BUILD_SCRIPT_FOLDER", dir.path().join("absent"))
        .arg("--dry-run");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("build failed: failed to read"));
}

#[test]
fn help_describes_the_dry_run_flag() {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.arg("--help");

    cmd.assert().success().stdout(contains("--dry-run"));
}
