//! Protocol error types

use thiserror::Error;

/// Errors raised while building frames or parsing protocol codes
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Hex literal contained a non-hex character or an odd number of digits
    #[error("Invalid hex frame literal: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Poll type name is not one of alpha, numeric, alphanumeric
    #[error("Unknown poll type '{0}' (expected alpha, numeric or alphanumeric)")]
    UnknownPollType(String),

    /// Frequency code outside a-d
    #[error("Invalid frequency code '{0}' (expected a letter a-d)")]
    InvalidFrequencyCode(char),

    /// Frequency pair was not exactly two letters
    #[error("Frequency combination '{0}' is not valid (expected two letters a-d, e.g. 'aa')")]
    InvalidFrequencyPair(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownPollType("multiple".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Unknown poll type"));
        assert!(msg.contains("multiple"));
    }

    #[test]
    fn test_frequency_pair_error() {
        let err = ProtocolError::InvalidFrequencyPair("zz".to_string());
        assert!(err.to_string().contains("'zz'"));
    }
}
