//! Error types for metacache
//!
//! Every fallible operation in the allocator, the free-space managers and
//! the metadata cache reports one of these. Nothing here is retried: the
//! caller of the enclosing file operation sees the error unchanged.

use thiserror::Error;

/// Common result type for metacache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for metacache
#[derive(Debug, Error)]
pub enum Error {
    // Address space errors
    #[error("out of address space: requested {requested} bytes at eoa {eoa}, limit {limit}")]
    OutOfSpace { requested: u64, eoa: u64, limit: u64 },

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal consistency errors
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    // Persisted structure errors
    #[error("cannot open free-space manager: {0}")]
    CannotOpen(String),

    #[error("cannot load cache image: {0}")]
    CannotLoad(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entry not found at address {0:#x}")]
    EntryNotFound(u64),

    // Driver errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an out-of-space error
    #[must_use]
    pub const fn out_of_space(requested: u64, eoa: u64, limit: u64) -> Self {
        Self::OutOfSpace {
            requested,
            eoa,
            limit,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an inconsistent state error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentState(msg.into())
    }

    /// Create a cannot-open error for a persisted free-space manager
    pub fn cannot_open(msg: impl Into<String>) -> Self {
        Self::CannotOpen(msg.into())
    }

    /// Create a cannot-load error for a persisted cache image
    pub fn cannot_load(msg: impl Into<String>) -> Self {
        Self::CannotLoad(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this error indicates a corrupt or truncated on-disk structure
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CannotOpen(_) | Self::CannotLoad(_))
    }

    /// Check if this error must fail a file close.
    ///
    /// Caller mistakes on individual entries do not; everything that leaves
    /// the allocator or the cache image half-built does.
    #[must_use]
    pub const fn is_fatal_to_close(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_) | Self::EntryNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_corruption() {
        assert!(Error::cannot_open("bad signature").is_corruption());
        assert!(Error::cannot_load("truncated").is_corruption());
        assert!(!Error::inconsistent("x").is_corruption());
    }

    #[test]
    fn test_error_fatal_to_close() {
        assert!(Error::out_of_space(10, 100, 105).is_fatal_to_close());
        assert!(Error::inconsistent("did not converge").is_fatal_to_close());
        assert!(!Error::EntryNotFound(0x40).is_fatal_to_close());
        assert!(!Error::invalid_argument("dup").is_fatal_to_close());
    }

    #[test]
    fn test_error_display() {
        let err = Error::out_of_space(4096, 8192, 10000);
        assert_eq!(
            err.to_string(),
            "out of address space: requested 4096 bytes at eoa 8192, limit 10000"
        );
        assert_eq!(Error::EntryNotFound(255).to_string(), "entry not found at address 0xff");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
