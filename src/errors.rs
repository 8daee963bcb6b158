//! Setup errors. Everything here happens before the first worker runs user
//! code; once the pool is up, internal failures go through the fatal
//! reporter instead.

use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "unrecognized option `{}`", _0)]
    UnknownOption(String),

    #[fail(display = "missing value for --{}", _0)]
    MissingOptionValue(&'static str),

    #[fail(display = "bad value for --{}: {}", _0, _1)]
    BadOptionValue(&'static str, String),

    #[fail(display = "worker thread creation failed: {}", _0)]
    ThreadSpawn(String),
}

pub type Result<T> = ::std::result::Result<T, Error>;
