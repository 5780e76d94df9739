// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI surface tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn mech_worker() -> Command {
    Command::cargo_bin("mech-worker").expect("binary builds")
}

#[test]
fn help_lists_all_commands() {
    mech_worker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn help_documents_env_overrides() {
    mech_worker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MECH_WORKSPACE_DIR"))
        .stdout(predicate::str::contains("MECH_SSH_HOST_ALIAS"))
        .stdout(predicate::str::contains("MECH_GATEWAY_URL"));
}

#[test]
fn unknown_command_exits_one() {
    mech_worker()
        .arg("frobnicate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn missing_config_fails_with_context() {
    mech_worker()
        .args(["--config", "/definitely/not/here.toml", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not/here.toml"));
}

#[test]
fn version_flag_succeeds() {
    mech_worker().arg("--version").assert().success();
}
