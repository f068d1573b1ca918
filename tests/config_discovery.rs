use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use tempfile::tempdir;

fn run_talkback<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_talkback"))
        .args(args)
        .env("HOME", home)
        .current_dir(cwd)
        .output()
        .expect("talkback command should execute")
}

fn assert_failure_mentions(output: &Output, needle: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "expected failure\nstdout:\n{}\nstderr:\n{stderr}",
        String::from_utf8_lossy(&output.stdout),
    );
    assert!(
        stderr.contains(needle),
        "stderr should mention `{needle}`\nstderr:\n{stderr}"
    );
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".talkback")).expect("home config dir should be created");

    let project_config = project_dir.join("talkback.toml");
    let home_config = home_dir.join(".talkback").join("config.toml");
    let override_config = sandbox.path().join("override.toml");

    fs::write(&project_config, "[proxy]\nunknown_project_key = 1\n")
        .expect("project config should be written");
    fs::write(&home_config, "[proxy]\nunknown_home_key = 1\n")
        .expect("home config should be written");

    let prefers_project = run_talkback(["serve"], &project_dir, &home_dir);
    assert_failure_mentions(&prefers_project, "unknown_project_key");

    fs::remove_file(&project_config).expect("project config should be removed");
    let falls_back_to_home = run_talkback(["serve"], &project_dir, &home_dir);
    assert_failure_mentions(&falls_back_to_home, "unknown_home_key");

    fs::write(&override_config, "[tapes]\nrecord = \"SOMETIMES\"\n")
        .expect("override config should be written");
    let with_override = run_talkback(
        [
            OsStr::new("serve"),
            OsStr::new("--config"),
            override_config.as_os_str(),
        ],
        &project_dir,
        &home_dir,
    );
    assert_failure_mentions(&with_override, "invalid record mode `SOMETIMES`");
}

#[test]
fn missing_explicit_config_is_reported() {
    let sandbox = tempdir().expect("tempdir should be created");
    let missing = sandbox.path().join("nope.toml");

    let output = run_talkback(
        [
            OsStr::new("serve"),
            OsStr::new("--config"),
            missing.as_os_str(),
        ],
        sandbox.path(),
        sandbox.path(),
    );
    assert_failure_mentions(&output, "read config");
}

#[test]
fn cli_record_override_is_validated() {
    let sandbox = tempdir().expect("tempdir should be created");
    let output = run_talkback(
        ["serve", "--record", "replay-only", "--log-level", "off"],
        sandbox.path(),
        sandbox.path(),
    );
    assert_failure_mentions(&output, "invalid record mode `replay-only`");
}
