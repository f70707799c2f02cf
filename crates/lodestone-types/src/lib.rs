//! # lodestone-types
//!
//! Shared domain types for the lodestone DHT workspace: 160-bit node
//! identifiers with the XOR distance metric, and network contacts.

pub mod contact;
pub mod id;

/// Width of a node identifier in bits.
pub const ID_BITS: usize = 160;

/// Width of a node identifier in bytes.
pub const ID_BYTES: usize = 20;

/// Error types for identifier parsing.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// The input slice has the wrong length for a node identifier.
    #[error("invalid identifier length: {got} bytes, expected {ID_BYTES}")]
    InvalidIdLength { got: usize },

    /// The input string is not valid hexadecimal.
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, TypeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(ID_BITS, 160);
        assert_eq!(ID_BYTES, 20);
        assert_eq!(ID_BITS, ID_BYTES * 8);
    }

    #[test]
    fn test_error_display() {
        let err = TypeError::InvalidIdLength { got: 19 };
        assert!(err.to_string().contains("19"));
        assert!(err.to_string().contains("20"));
    }
}
