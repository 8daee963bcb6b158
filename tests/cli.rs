//! The option surface as a program sees it.

use std::process::Command;

fn fib(configure: impl FnOnce(&mut Command)) -> std::process::Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fib"));
    configure(&mut cmd);
    cmd.output().expect("failed to run fib")
}

#[test]
fn help_prints_usage_and_exits_zero() {
    let out = fib(|c| {
        c.arg("--help");
    });
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("--deqdepth"));
}

#[test]
fn unknown_option_is_an_error() {
    let out = fib(|c| {
        c.args(&["--frobnicate", "10"]);
    });
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--frobnicate"));
    assert!(stderr.contains("--nproc"), "usage should follow the error");
}

#[test]
fn double_dash_passes_the_rest_through() {
    let out = fib(|c| {
        c.args(&["--nproc", "2", "--", "11"]);
    });
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("Result: 89"));
}

#[test]
fn runtime_options_are_invisible_to_the_program() {
    let out = fib(|c| {
        c.args(&["--nproc", "2", "--deqdepth", "256", "12"]);
    });
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("Result: 144"));
}

#[test]
fn env_override_beats_the_flag() {
    // CILK_NWORKERS=1 forces a lone worker no matter what --nproc says;
    // the program still computes the right answer
    let out = fib(|c| {
        c.env("CILK_NWORKERS", "1").args(&["--nproc", "4", "10"]);
    });
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("Result: 55"));
}

#[test]
fn missing_program_argument_fails() {
    let out = fib(|c| {
        c.arg("--nproc");
    });
    assert!(!out.status.success());
}
