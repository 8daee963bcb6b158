//! Shutdown hygiene: when `run_with` returns, every worker has joined and
//! every fiber the run allocated has been given back.

extern crate tine;

mod common;

use tine::Options;

#[test]
fn no_fiber_outlives_the_pool() {
    // several runs with different shapes, back to back
    for &nproc in &[1usize, 2, 3] {
        let options = Options {
            nproc,
            ..Options::default()
        };
        let run = common::run_fib(options, 16);
        assert_eq!(run.result, 987);
    }

    assert_eq!(
        tine::live_fibers(),
        0,
        "fibers leaked across pool shutdown"
    );
}
