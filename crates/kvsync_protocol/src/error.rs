//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Value could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A numeric code does not name any known variant.
    #[error("unknown {kind} code: {code}")]
    UnknownCode {
        /// Which enumeration was being decoded.
        kind: &'static str,
        /// The offending code.
        code: u8,
    },

    /// A message carried a payload for a different message id.
    #[error("unexpected payload for {0:?}")]
    UnexpectedPayload(crate::MessageId),

    /// Time sync timestamps give an offset outside the `TimeOffset` range.
    #[error("time offset out of range")]
    TimeOffsetOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnknownCode {
            kind: "sync mode",
            code: 9,
        };
        assert_eq!(err.to_string(), "unknown sync mode code: 9");
    }
}
