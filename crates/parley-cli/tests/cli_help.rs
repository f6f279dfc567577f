use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("parley")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("keys"))
        .stdout(predicate::str::contains("providers"))
        .stdout(predicate::str::contains("--provider"));
}

#[test]
fn test_keys_help_shows_subcommands() {
    cargo_bin_cmd!("parley")
        .args(["keys", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("set"));
}

#[test]
fn test_send_help_shows_attach() {
    cargo_bin_cmd!("parley")
        .args(["send", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--prompt"))
        .stdout(predicate::str::contains("--attach"));
}

#[test]
fn test_version_flag() {
    cargo_bin_cmd!("parley")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}

#[test]
fn test_unknown_mode_is_rejected() {
    cargo_bin_cmd!("parley")
        .args(["--mode", "free", "providers"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mode"));
}
