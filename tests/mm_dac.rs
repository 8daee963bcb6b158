//! Divide-and-conquer matrix multiply against the sequential triple loop,
//! through the self-checking mm_dac binary.

use std::process::Command;

fn mm_dac(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_mm_dac"))
        .args(args)
        .output()
        .expect("failed to run mm_dac")
}

#[test]
fn matches_the_sequential_product() {
    for &nproc in &["1", "2", "4"] {
        let out = mm_dac(&["--nproc", nproc, "64"]);
        assert!(
            out.status.success(),
            "nproc={}: stderr: {}",
            nproc,
            String::from_utf8_lossy(&out.stderr)
        );
        assert!(String::from_utf8_lossy(&out.stdout).contains("passed"));
    }
}

#[test]
fn smallest_divisible_input() {
    // 16 splits exactly once into base-case blocks
    let out = mm_dac(&["16"]);
    assert!(out.status.success());
}

#[test]
fn below_threshold_runs_serial() {
    let out = mm_dac(&["8"]);
    assert!(out.status.success());
}

#[test]
fn rejects_non_power_of_two() {
    let out = mm_dac(&["--nproc", "1", "48"]);
    assert!(!out.status.success());
}
