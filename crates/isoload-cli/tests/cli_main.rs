//! Basic CLI tests for the isoload command-line interface.

use assert_cmd::Command;
use predicates::prelude::*;

fn isoload() -> Command {
    let mut cmd = Command::cargo_bin("isoload").unwrap();
    cmd.env_remove("ISOLOAD_CONFIG")
        .env_remove("ISOLOAD_PLUGIN_DIR")
        .env_remove("ISOLOAD_PLUGIN_BINARY")
        .env_remove("ISOLOAD_SHARED_PATH");
    cmd
}

fn library_file_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    isoload()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("check-layout"));
}

/// Test that the CLI shows version information.
#[test]
fn test_cli_version() {
    isoload()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("isoload"));
}

#[test]
fn test_detach_requires_serve() {
    isoload()
        .args(["run", "--detach", "--no-prompt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--serve"));
}

#[test]
fn test_check_layout_ok() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("plugin.toml"),
        r#"
references = ["codec"]

[dependencies]
codec = "^1.2"
"#,
    )
    .unwrap();
    std::fs::write(dir.path().join(library_file_name("plugin")), b"").unwrap();
    std::fs::create_dir(dir.path().join("deps")).unwrap();
    std::fs::write(dir.path().join("deps").join(library_file_name("codec-1.2.4")), b"").unwrap();

    isoload()
        .arg("check-layout")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("private"))
        .stdout(predicate::str::contains("Layout OK"));
}

#[test]
fn test_check_layout_missing_shared_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let shared = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plugin.toml"), r#"references = ["runtime"]"#).unwrap();
    std::fs::write(dir.path().join(library_file_name("plugin")), b"").unwrap();

    isoload()
        .arg("--shared-path")
        .arg(shared.path())
        .arg("check-layout")
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("MISSING"))
        .stderr(predicate::str::contains("1 problem(s)"));
}

#[test]
fn test_flags_override_environment() {
    let dir = tempfile::tempdir().unwrap();
    let shared = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plugin.toml"), r#"references = ["runtime"]"#).unwrap();
    std::fs::write(dir.path().join(library_file_name("plugin")), b"").unwrap();
    std::fs::write(shared.path().join(library_file_name("runtime")), b"").unwrap();

    isoload()
        .env("ISOLOAD_PLUGIN_DIR", dir.path().join("elsewhere"))
        .env("ISOLOAD_SHARED_PATH", dir.path().join("nowhere"))
        .arg("--plugin-dir")
        .arg(dir.path())
        .arg("--shared-path")
        .arg(shared.path())
        .arg("check-layout")
        .assert()
        .success()
        .stdout(predicate::str::contains("shared"))
        .stdout(predicate::str::contains("Layout OK"));
}

#[test]
fn test_environment_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(library_file_name("plugin")), b"").unwrap();

    isoload()
        .env("ISOLOAD_PLUGIN_DIR", dir.path())
        .arg("check-layout")
        .assert()
        .success()
        .stdout(predicate::str::contains("Layout OK"));
}

#[test]
fn test_run_without_plugin_fails() {
    let dir = tempfile::tempdir().unwrap();
    isoload()
        .arg("--plugin-dir")
        .arg(dir.path())
        .args(["run", "--no-prompt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load plugin"));
}
