//! Error types for sentence parsing

use thiserror::Error;

/// Errors that can occur while parsing a sentence
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line does not start with the `$` sentence marker
    #[error("missing '$' start marker")]
    MissingStart,

    /// Line has no `*` checksum delimiter in the expected position
    #[error("missing '*' checksum delimiter")]
    MissingChecksum,

    /// Checksum digits are not valid hexadecimal
    #[error("invalid checksum digits: {0}")]
    InvalidChecksum(String),

    /// Address field is too short to carry a talker and sentence type
    #[error("invalid address field: {0}")]
    InvalidAddress(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}
