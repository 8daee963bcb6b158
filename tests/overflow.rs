//! Shadow-stack overflow must be detected and reported, not papered over.
//! Exercised through the spawn_deep binary so the abort can be observed
//! from outside.

use std::process::Command;

fn spawn_deep(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_spawn_deep"))
        .args(args)
        .output()
        .expect("failed to run spawn_deep")
}

#[test]
fn deep_spawns_overflow_a_shallow_queue() {
    let out = spawn_deep(&["--nproc", "1", "--deqdepth", "8", "20"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("overflow"),
        "expected an overflow report, got: {}",
        stderr
    );
}

#[test]
fn a_single_slot_queue_cannot_even_boot_a_spawn() {
    let out = spawn_deep(&["--nproc", "1", "--deqdepth", "1", "5"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("overflow"));
}

#[test]
fn ample_queue_runs_clean() {
    let out = spawn_deep(&["--nproc", "1", "--deqdepth", "64", "12"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
}
