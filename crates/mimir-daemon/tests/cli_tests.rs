//! Command line smoke tests

use assert_cmd::Command;
use mimir_core::{CachingNode, FileNode, FileNodeConfig};
use mimir_daemon::{Daemon, DaemonConfig, Runtime};
use predicates::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn mimir(basedir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("mimir").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("MIMIR_LOG")
        .arg("-D")
        .arg(format!("mimir.basedir={}", basedir.display()));
    cmd
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("mimir").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("preseed"));
}

#[test]
fn test_status_without_daemon_exits_3() {
    let tmp = TempDir::new().unwrap();
    mimir(tmp.path())
        .arg("status")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not running"));
}

#[test]
fn test_malformed_override_exits_2() {
    let mut cmd = Command::cargo_bin("mimir").unwrap();
    cmd.args(["status", "-D", "novalue"]).assert().code(2);
}

#[test]
fn test_invalid_key_exits_2() {
    let tmp = TempDir::new().unwrap();
    mimir(tmp.path())
        .args(["locate", "not-a-key"])
        .assert()
        .code(2);
}

#[test]
fn test_malformed_config_file_exits_2() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("mimir.toml"), "[mimir").unwrap();
    mimir(tmp.path()).arg("status").assert().code(2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_then_locate_against_running_daemon() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("mimir-socket");
    let system = FileNode::new(FileNodeConfig::new("file", tmp.path().join("local"))).unwrap();
    let daemon = Arc::new(Daemon::new(
        DaemonConfig::new(&socket),
        Runtime {
            caching: Arc::new(CachingNode::new(Vec::new(), Arc::new(system), Vec::new())),
            publishers: Vec::new(),
        },
    ));
    let listener = daemon.bind().await.unwrap();
    let server = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move { daemon.serve(listener).await }
    });

    let src = tmp.path().join("hello.txt");
    std::fs::write(&src, "Hello World!").unwrap();
    let basedir = tmp.path().to_path_buf();

    tokio::task::spawn_blocking(move || {
        mimir(&basedir)
            .args(["store", "mimir:file:bucketX:hello.txt"])
            .arg(&src)
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "c.SHA-1=2ef7bde608ce5404e97d5f042f95f89f1c232871",
            ));

        mimir(&basedir)
            .args(["locate", "mimir:file:bucketX:hello.txt"])
            .assert()
            .success()
            .stdout(predicate::str::contains("m.content-length=12"));

        mimir(&basedir)
            .args(["locate", "mimir:file:bucketX:missing.txt"])
            .assert()
            .code(1);

        mimir(&basedir).arg("checksums").assert().success().stdout("SHA-1\nSHA-512\n");

        mimir(&basedir).arg("shutdown").assert().success();
    })
    .await
    .unwrap();

    server.await.unwrap().unwrap();
    assert!(!socket.exists());
}
