//! Error types for zipflow

use std::io;
use thiserror::Error;

/// Result type for zipflow operations
pub type Result<T> = std::result::Result<T, ZipError>;

/// Error kinds that can surface from archive operations.
///
/// Kinds are stable: callers may match on them to distinguish a malformed
/// archive from a missing password or a failed integrity check.
#[derive(Debug, Error)]
pub enum ZipError {
    /// I/O error from a source or sink
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Missing EOCD, wrong signature at a required offset, ZIP64 sentinel
    /// without a backing extra field, or out-of-range counts
    #[error("bad archive format: {0}")]
    BadFormat(String),

    /// Entry requires a password and none was supplied
    #[error("entry is password-protected and no password was supplied")]
    Encrypted,

    /// AES extra field present with a strength other than 3 (AES-256)
    #[error("unsupported encryption strength: {0}")]
    UnsupportedEncryption(u8),

    /// Compression method this crate does not handle, or an encrypted entry
    /// whose stored method is not the AES wrapper (0x63)
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    /// CRC-32 or HMAC mismatch when finalising an extraction
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    /// AES password verification bytes did not match
    #[error("incorrect password")]
    InvalidPassword,

    /// Writer `add` collides with an existing entry name
    #[error("duplicate entry name: {0}")]
    DuplicatedName(String),

    /// Archive comment does not fit the 16-bit EOCD length field
    #[error("archive comment exceeds the maximum length")]
    ZipCommentTooLong,

    /// Entry not found in the archive
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// Inconsistent process-wide configuration
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// A codec worker died or a poisoned stage was reused
    #[error("codec worker failed: {0}")]
    WorkerFailed(String),
}
