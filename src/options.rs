//! Runtime configuration, from the command line and the environment.
//!
//! The runtime is linked into the user's binary, so it picks its own long
//! options out of `argv` and leaves everything else for the program.

use std::env;

use crate::errors::{Error, Result};

const DEFAULT_DEQ_DEPTH: usize = 1024;
const DEFAULT_STACK_SIZE: usize = 1 << 20;
const DEFAULT_ALLOC_BATCH: usize = 8;
const MIN_ALLOC_BATCH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Number of workers; 0 means one per online core.
    pub nproc: usize,
    /// Shadow-stack entries per worker.
    pub deqdepth: usize,
    /// Per-fiber stack size in bytes.
    pub stacksize: usize,
    /// Batch length for the closure and fiber pools.
    pub alloc_batch: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            nproc: 0,
            deqdepth: DEFAULT_DEQ_DEPTH,
            stacksize: DEFAULT_STACK_SIZE,
            alloc_batch: DEFAULT_ALLOC_BATCH,
        }
    }
}

impl Options {
    /// The worker count to actually run with: `CILK_NWORKERS` beats
    /// `--nproc`, and 0 resolves to the number of online cores.
    pub fn effective_nproc(&self) -> usize {
        let mut nproc = self.nproc;
        if let Ok(value) = env::var("CILK_NWORKERS") {
            if !value.is_empty() {
                if let Ok(n) = value.parse::<usize>() {
                    if n > 0 {
                        nproc = n;
                    }
                }
            }
        }
        if nproc == 0 {
            nproc = num_cpus::get();
        }
        nproc.max(1)
    }
}

/// Outcome of command-line parsing.
pub enum Parsed {
    /// Options plus the arguments left for the program (`argv[0]` first).
    Run(Options, Vec<String>),
    /// `--help` was given; usage has been printed already.
    Help,
}

pub fn usage() {
    eprintln!("tine runtime options:");
    eprintln!("     --nproc <n> : set number of workers (0 = all cores)");
    eprintln!("     --deqdepth <n> : set number of entries per deque");
    eprintln!("     --stacksize <n> : set the size of a fiber in bytes");
    eprintln!("     --alloc-batch <n> : set batch length for memory pools");
    eprintln!("     --help : print this message");
    eprintln!("     -- : end of option parsing");
    eprintln!();
}

fn numeric(name: &'static str, value: Option<String>) -> Result<usize> {
    let value = value.ok_or(Error::MissingOptionValue(name))?;
    value
        .parse::<usize>()
        .map_err(|_| Error::BadOptionValue(name, value))
}

/// Picks the runtime's own options out of `args`; everything else is kept,
/// in order, for the program.
pub fn parse<I>(args: I) -> Result<Parsed>
where
    I: IntoIterator<Item = String>,
{
    let mut options = Options::default();
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if !arg.starts_with("--") || arg.len() == 2 {
            if arg == "--" {
                rest.extend(iter);
                break;
            }
            rest.push(arg);
            continue;
        }

        match &arg[2..] {
            "nproc" => options.nproc = numeric("nproc", iter.next())?,
            "deqdepth" => {
                let n = numeric("deqdepth", iter.next())?;
                if n == 0 {
                    return Err(Error::BadOptionValue("deqdepth", "0".into()));
                }
                options.deqdepth = n;
            }
            "stacksize" => {
                let n = numeric("stacksize", iter.next())?;
                if n == 0 {
                    return Err(Error::BadOptionValue("stacksize", "0".into()));
                }
                options.stacksize = n;
            }
            "alloc-batch" => {
                options.alloc_batch = numeric("alloc-batch", iter.next())?.max(MIN_ALLOC_BATCH);
            }
            "help" => {
                usage();
                return Ok(Parsed::Help);
            }
            _ => return Err(Error::UnknownOption(arg)),
        }
    }

    Ok(Parsed::Run(options, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn parse_ok(v: &[&str]) -> (Options, Vec<String>) {
        match parse(args(v)).unwrap() {
            Parsed::Run(options, rest) => (options, rest),
            Parsed::Help => panic!("unexpected --help"),
        }
    }

    #[test]
    fn defaults() {
        let (options, rest) = parse_ok(&["fib", "26"]);
        assert_eq!(options, Options::default());
        assert_eq!(rest, args(&["fib", "26"]));
    }

    #[test]
    fn picks_runtime_options() {
        let (options, rest) = parse_ok(&["fib", "--nproc", "3", "--deqdepth", "64", "26"]);
        assert_eq!(options.nproc, 3);
        assert_eq!(options.deqdepth, 64);
        assert_eq!(rest, args(&["fib", "26"]));
    }

    #[test]
    fn alloc_batch_floor() {
        let (options, _) = parse_ok(&["x", "--alloc-batch", "2"]);
        assert_eq!(options.alloc_batch, 8);
    }

    #[test]
    fn double_dash_ends_options() {
        let (options, rest) = parse_ok(&["x", "--nproc", "2", "--", "--deqdepth", "9"]);
        assert_eq!(options.nproc, 2);
        assert_eq!(options.deqdepth, DEFAULT_DEQ_DEPTH);
        assert_eq!(rest, args(&["x", "--deqdepth", "9"]));
    }

    #[test]
    fn rejects_unknown() {
        assert!(parse(args(&["x", "--frobnicate"])).is_err());
    }

    #[test]
    fn rejects_zero_depth() {
        assert!(parse(args(&["x", "--deqdepth", "0"])).is_err());
        assert!(parse(args(&["x", "--stacksize", "0"])).is_err());
        assert!(parse(args(&["x", "--deqdepth"])).is_err());
        assert!(parse(args(&["x", "--deqdepth", "many"])).is_err());
    }

    #[test]
    fn env_overrides_nproc() {
        let options = Options {
            nproc: 8,
            ..Options::default()
        };
        env::set_var("CILK_NWORKERS", "3");
        assert_eq!(options.effective_nproc(), 3);
        env::remove_var("CILK_NWORKERS");
        assert_eq!(options.effective_nproc(), 8);
    }
}
