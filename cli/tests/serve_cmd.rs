use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_serve_command() {
    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn serve_help_shows_the_flags() {
    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--config-path"))
        .stdout(predicate::str::contains("--direct-command"))
        .stdout(predicate::str::contains("--static-path"));
}

#[test]
fn version_prints_the_package_version() {
    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn invalid_port_is_a_usage_error() {
    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .args(["serve", "-p", "not-a-port"])
        .assert()
        .failure();
}

#[test]
fn invalid_configuration_exits_with_code_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("opwire-agent.json");
    std::fs::write(&config, r#"{ "version": "definitely not a version" }"#).expect("write");

    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .args(["serve", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not valid"));
}

#[test]
fn duplicated_url_patterns_abort_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("opwire-agent.json");
    std::fs::write(
        &config,
        r#"{
            "resources": {
                "a": { "default": { "command": "cat" }, "pattern": "/x/{one}" },
                "b": { "default": { "command": "cat" }, "pattern": "/x/{two}" }
            }
        }"#,
    )
    .expect("write");

    Command::cargo_bin("opwire-agent")
        .expect("binary")
        .args(["serve", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("duplicated"));
}
