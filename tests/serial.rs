//! Single-worker runs: the runtime must degrade to a strict depth-first
//! executor with no steals and no closures beyond the root.

extern crate tine;

mod common;

use tine::Options;

#[test]
fn one_worker_is_a_dfs_executor() {
    let options = Options {
        nproc: 1,
        ..Options::default()
    };
    let run = common::run_fib(options, 18);
    assert_eq!(run.result, 2584);
    assert_eq!(run.steals, 0, "a lone worker has nobody to steal from");
}

#[test]
fn one_worker_minimal_depth() {
    // fib(10) exposes at most eleven parents at once (root spawn included),
    // so twelve slots are exactly enough
    let options = Options {
        nproc: 1,
        deqdepth: 12,
        ..Options::default()
    };
    let run = common::run_fib(options, 10);
    assert_eq!(run.result, 55);
    assert_eq!(run.steals, 0);
}
