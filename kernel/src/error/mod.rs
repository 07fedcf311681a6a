//! Runtime error type
//!
//! Only failures that are ordinary control flow live here. Contract
//! violations (blocking while holding a spinlock, joining a reclaimed
//! handle, blocking inside a timer callback) are documented preconditions
//! and are not checked at runtime.

use core::fmt;

/// Error codes shared with the rest of the system.
pub const ERR_INVALID_ARGS: isize = -2;
pub const ERR_NO_MEMORY: isize = -6;

/// Custom error type for runtime operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Stack or control-block storage could not be allocated
    OutOfMemory,
    /// Argument rejected before any resource was committed
    InvalidArgument,
}

impl Error {
    /// Converts the error to a numeric error code
    pub fn to_error_code(&self) -> isize {
        match self {
            Error::OutOfMemory => ERR_NO_MEMORY,
            Error::InvalidArgument => ERR_INVALID_ARGS,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
