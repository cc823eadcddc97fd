//! Frame validation limits and decode errors

use thiserror::Error;

/// Decode errors. Every variant is fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown command code {0}")]
    UnknownCommand(u8),

    #[error("Field too long: {size} bytes (max: {max})")]
    FieldTooLong { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    Invalid(&'static str),
}

/// Maximum length of names, usernames, addresses and other control strings
pub const MAX_CONTROL_FIELD_LEN: usize = 4096;

/// Maximum length of a JSON_CONTROL document
pub const MAX_JSON_LEN: usize = 32 * 1024;

/// Maximum length of a CHANNEL_DATA payload (1MB)
pub const MAX_DATA_LEN: usize = 1024 * 1024;

/// Validate a declared field length against a sanity bound
pub fn check_field_len(size: usize, max: usize) -> Result<(), DecodeError> {
    if size > max {
        return Err(DecodeError::FieldTooLong { size, max });
    }
    Ok(())
}
