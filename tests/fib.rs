extern crate rand;
extern crate tine;

mod common;

use rand::{Rng, SeedableRng, XorShiftRng};
use tine::Options;

#[test]
fn fib_10_across_pool_shapes() {
    for &nproc in &[1usize, 2, 4] {
        for &deqdepth in &[12usize, 64, 1024] {
            let options = Options {
                nproc,
                deqdepth,
                ..Options::default()
            };
            let run = common::run_fib(options, 10);
            assert_eq!(
                run.result, 55,
                "fib(10) wrong with nproc={} deqdepth={}",
                nproc, deqdepth
            );
        }
    }
}

#[test]
fn fib_26_on_full_pool() {
    let run = common::run_fib(Options::default(), 26);
    assert_eq!(run.result, 121_393);
}

#[test]
fn deterministic_across_pool_sizes() {
    let mut inputs = vec![0u64, 1, 2, 20];
    let mut rng = XorShiftRng::from_seed(*b"tine-fib-inputs!");
    for _ in 0..4 {
        inputs.push(rng.gen_range(3, 18));
    }

    for &n in &inputs {
        let serial = common::run_fib(
            Options {
                nproc: 1,
                ..Options::default()
            },
            n,
        );
        let parallel = common::run_fib(
            Options {
                nproc: 4,
                ..Options::default()
            },
            n,
        );
        assert_eq!(serial.result, parallel.result);
        assert_eq!(serial.result, common::fib_reference(n));
    }
}
