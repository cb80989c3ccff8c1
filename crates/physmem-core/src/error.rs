//! Error types for physical memory access.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Physical access outside the addressable range
    #[error("physical access out of bounds: address=0x{address:x}, length=0x{length:x}")]
    OutOfBounds { address: u64, length: u64 },

    /// Malformed range
    #[error("Invalid range: {0}")]
    InvalidRange(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
