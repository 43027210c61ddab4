use std::process::{Command, Output, Stdio};

/// Runs the binary from the crate root with the config variables cleared.
fn exlower(args: &[&str]) -> Output {
    exlower_with_env(args, &[])
}

fn exlower_with_env(args: &[&str], vars: &[(&str, &str)]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_exlower"))
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .args(args)
        .env_remove("EXLOWER_MAX_STEPS")
        .env_remove("EXLOWER_EMIT")
        .envs(vars.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("failed to run exlower")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn check_reports_lowered_functions() {
    let output = exlower(&["check", "demos/retry.rgn"]);
    assert!(output.status.success(), "check failed: {}", stderr(&output));
    // the method plus its four region functions
    assert!(stdout(&output).contains("1 methods, 5 functions"));
}

#[test]
fn lower_prints_the_exception_protocol() {
    let output = exlower(&["lower", "demos/retry.rgn"]);
    assert!(output.status.success(), "lower failed: {}", stderr(&output));
    let text = stdout(&output);
    for needle in [
        "exception-entry",
        "exception-body-continue",
        "exception-ensure",
        "demo$begin1",
        "demo$rescue1",
        "demo$else1",
        "demo$ensure1",
        "rt_try",
    ] {
        assert!(text.contains(needle), "missing `{needle}` in:\n{text}");
    }
}

#[test]
fn run_retries_until_the_handler_gives_up() {
    let output = exlower(&["run", "demos/retry.rgn"]);
    assert!(output.status.success(), "run failed: {}", stderr(&output));
    assert_eq!(stdout(&output), "1\n2\n3\nslow\ncleanup\n=> 3\n");
}

#[test]
fn run_fails_on_an_unhandled_exception() {
    let output = exlower(&["run", "demos/unhandled.rgn"]);
    assert!(!output.status.success());
    assert_eq!(stdout(&output), "cleanup\n");
    assert!(stderr(&output).contains("uncaught exception #<Boom: no clause matches>"));
}

#[test]
fn run_honours_the_step_limit() {
    let output = exlower(&["run", "demos/retry.rgn", "--max-steps", "5"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Runtime error"));
}

#[test]
fn check_rejects_retry_outside_rescue() {
    let output = exlower(&["check", "demos/broken.rgn"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("`retry` used outside of a rescue clause"));
}

#[test]
fn unknown_emit_target_is_rejected() {
    let output = exlower(&["lower", "demos/retry.rgn", "--emit", "wasm"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("wasm"));
}

#[test]
fn run_ignores_the_emit_setting() {
    let output = exlower_with_env(&["run", "demos/retry.rgn"], &[("EXLOWER_EMIT", "wasm")]);
    assert!(output.status.success(), "run failed: {}", stderr(&output));
}

#[test]
fn zero_step_limit_is_rejected_from_flag_and_environment() {
    let output = exlower(&["run", "demos/retry.rgn", "--max-steps", "0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid step limit `0`"));

    let output = exlower_with_env(&["run", "demos/retry.rgn"], &[("EXLOWER_MAX_STEPS", "0")]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid step limit `0`"));
}
