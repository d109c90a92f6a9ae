//! Error taxonomy (spec.md §7). `ErrorKind` is what crosses the wire in a
//! reply; `Error` additionally carries context for logging.

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Arg,
    NoEntry,
    Exists,
    Again,
    RingChange,
    Recover,
    Io,
    Corrupt,
    NoMem,
    Hwait,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request: {0}")]
    Arg(String),
    #[error("no entry")]
    NoEntry,
    #[error("already exists")]
    Exists,
    #[error("transient contention, retry")]
    Again,
    #[error("directory moved to a different owner")]
    RingChange,
    #[error("unclean prior shutdown, recovery required")]
    Recover,
    #[error("storage i/o error: {0}")]
    Io(String),
    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),
    #[error("allocation failure")]
    NoMem,
    #[error("destination not ready, retry later")]
    Hwait,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Arg(_) => ErrorKind::Arg,
            Error::NoEntry => ErrorKind::NoEntry,
            Error::Exists => ErrorKind::Exists,
            Error::Again => ErrorKind::Again,
            Error::RingChange => ErrorKind::RingChange,
            Error::Recover => ErrorKind::Recover,
            Error::Io(_) => ErrorKind::Io,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::NoMem => ErrorKind::NoMem,
            Error::Hwait => ErrorKind::Hwait,
        }
    }
}

impl From<mdsl::MdslError> for Error {
    fn from(e: mdsl::MdslError) -> Self {
        match e {
            mdsl::MdslError::NotFound { .. } => Error::NoEntry,
            mdsl::MdslError::Io { .. } => Error::Io(e.to_string()),
            mdsl::MdslError::Corrupt { .. } => Error::Corrupt(e.to_string()),
            mdsl::MdslError::Full(_) => Error::NoMem,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Base backoff unit between `Again` retries; scaled by attempt number and
/// jittered so a thundering herd of retrying callers doesn't re-contend in
/// lockstep.
const RETRY_BACKOFF_BASE: std::time::Duration = std::time::Duration::from_millis(1);

/// Runs `f`, retrying while it returns `Error::Again`, up to `budget` times,
/// before surfacing — spec.md §7's "Again is retried locally up to a
/// bounded budget before surfacing." Each retry waits a jittered, linearly
/// increasing backoff rather than spinning immediately.
pub fn retry_again<T>(budget: usize, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(Error::Again) if attempt < budget => {
                attempt += 1;
                let jitter: u8 = rand::thread_rng().gen();
                let backoff = RETRY_BACKOFF_BASE * attempt as u32 + std::time::Duration::from_micros(jitter as u64 * 50);
                std::thread::sleep(backoff);
                continue;
            }
            other => return other,
        }
    }
}
