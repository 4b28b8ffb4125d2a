//! Wire-level error types

use thiserror::Error;

/// Errors raised while framing, encoding or decoding OpenFlow messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Invalid header length {0} (must be between 8 and 65535)")]
    BadLength(usize),

    #[error("Unsupported OpenFlow version {0:#04x}")]
    BadVersion(u8),

    #[error("Header length {header} does not match buffer length {buffer}")]
    LengthMismatch { header: usize, buffer: usize },

    #[error("Malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("Message too large to encode: {0} bytes")]
    TooLarge(usize),
}

impl WireError {
    pub fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        WireError::Truncated {
            what,
            needed,
            available,
        }
    }

    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        WireError::Malformed {
            what,
            detail: detail.into(),
        }
    }

    /// Returns true if the byte stream can no longer be re-synchronised
    pub fn breaks_framing(&self) -> bool {
        matches!(self, WireError::BadLength(_))
    }
}

impl From<WireError> for ofc_core::Error {
    fn from(err: WireError) -> Self {
        ofc_core::Error::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaks_framing() {
        assert!(WireError::BadLength(4).breaks_framing());
        assert!(!WireError::BadVersion(4).breaks_framing());
    }

    #[test]
    fn test_into_core_protocol_error() {
        let err: ofc_core::Error = WireError::truncated("header", 8, 3).into();
        assert!(matches!(err, ofc_core::Error::Protocol(_)));
        assert!(err.is_recoverable());
    }
}
