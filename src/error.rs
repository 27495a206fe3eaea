//! Error type for the fallible parts of the crate.
//!
//! Log delivery itself never fails: transport problems close the affected
//! stream and are reported through closed handlers. Errors only come out of
//! setup (creating transports) and access-checked control operations.

use std::fmt;
use std::io;

/// Errors returned by this crate.
#[non_exhaustive]
pub enum Error {
    /// An operating system call failed.
    Io { source: io::Error },
    /// The access policy refused the operation.
    AccessDenied { peer: String, action: &'static str },
}

impl fmt::Display for Error {
    // Non-exhaustive, so keep a catch-all arm
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { source } => write!(f, "I/O error: {}", source),
            Error::AccessDenied { peer, action } => {
                write!(f, "peer '{}' is not allowed to {}", peer, action)
            }
            _ => write!(f, "logstream error"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for Error {
    #[allow(unreachable_patterns)]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
