use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn lists_subcommands() {
    Command::cargo_bin("jobctl").unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("run-now"))
        .stdout(contains("disable"));
}

#[test]
fn unreachable_instance_fails() {
    Command::cargo_bin("jobctl").unwrap()
        .args(["--url", "http://127.0.0.1:9", "status"])
        .assert()
        .failure()
        .stderr(contains("cannot reach"));
}

#[test]
fn rejects_unknown_state_filter() {
    Command::cargo_bin("jobctl").unwrap()
        .args(["executions", "--state", "BOGUS"])
        .assert()
        .failure()
        .stderr(contains("unknown state BOGUS"));
}
