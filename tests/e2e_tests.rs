mod common;

use assert_cmd::Command;
use common::get_nodefuse_path;
use predicates::prelude::*;
use tempfile::TempDir;

fn nodefuse(config_dir: &TempDir) -> Command {
    let mut cmd = Command::new(get_nodefuse_path());
    cmd.env("NODEFUSE_CONFIG_DIR", config_dir.path());
    cmd
}

#[test]
fn test_help_lists_arguments() {
    let config_dir = TempDir::new().unwrap();
    nodefuse(&config_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("BACKING_DIR"))
        .stdout(predicate::str::contains("MOUNTPOINT"))
        .stdout(predicate::str::contains("--client-inodes"));
}

#[test]
fn test_missing_arguments_fail() {
    let config_dir = TempDir::new().unwrap();
    nodefuse(&config_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_err_backing_dir_missing() {
    let config_dir = TempDir::new().unwrap();
    let mountpoint = TempDir::new().unwrap();
    let missing = mountpoint.path().join("does-not-exist");

    nodefuse(&config_dir)
        .arg(&missing)
        .arg(mountpoint.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a directory"));
}

#[test]
fn test_err_same_directory() {
    let config_dir = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();

    nodefuse(&config_dir)
        .arg(dir.path())
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("must differ"));
}

#[test]
fn test_err_invalid_default_config() {
    let config_dir = TempDir::new().unwrap();
    std::fs::write(
        config_dir.path().join("config.toml"),
        "[mount]\nmax_write = 100\n",
    )
    .unwrap();
    let backing = TempDir::new().unwrap();
    let mountpoint = TempDir::new().unwrap();

    nodefuse(&config_dir)
        .arg(backing.path())
        .arg(mountpoint.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_write"));
}

#[test]
fn test_err_explicit_config_missing() {
    let config_dir = TempDir::new().unwrap();
    let backing = TempDir::new().unwrap();
    let mountpoint = TempDir::new().unwrap();

    nodefuse(&config_dir)
        .arg(backing.path())
        .arg(mountpoint.path())
        .arg("--config")
        .arg(config_dir.path().join("nope.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}
