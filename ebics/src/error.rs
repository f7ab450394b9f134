//! Error types for the EBICS engine

use crate::codes::ReturnCode;
use thiserror::Error;

/// Result type for EBICS operations
pub type Result<T> = std::result::Result<T, Error>;

/// EBICS engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Key handling, signing or decryption failed; never retryable
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Envelope or order data did not parse
    #[error("XML error: {0}")]
    Xml(#[from] moneta_xml::Error),

    /// The bank answered with a non-OK return code
    #[error("EBICS error {technical}/{business}: {reason}")]
    Protocol {
        /// Return code from the transport header
        technical: ReturnCode,
        /// Return code from the response body
        business: ReturnCode,
        /// Report text from the response
        reason: String,
    },

    /// HTTP-level failure talking to the bank; retryable
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation illegal in the current subscriber state
    #[error("invalid state: {0}")]
    State(String),
}

impl Error {
    /// Protocol error from a response code pair.
    pub fn protocol(technical: ReturnCode, business: ReturnCode, reason: impl Into<String>) -> Self {
        Error::Protocol {
            technical,
            business,
            reason: reason.into(),
        }
    }

    /// Whether a retry on a later tick can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Protocol {
                technical, business, ..
            } => technical.is_retryable() || business.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::retcodes;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(Error::Transport("connection reset".to_string()).is_retryable());
        assert!(!Error::Crypto("bad signature".to_string()).is_retryable());
    }

    #[test]
    fn protocol_retryability_follows_the_code_class() {
        let transient = Error::protocol(
            ReturnCode::new(retcodes::INTERNAL_ERROR),
            ReturnCode::ok(),
            "internal error",
        );
        assert!(transient.is_retryable());

        let fatal = Error::protocol(
            ReturnCode::ok(),
            ReturnCode::new(retcodes::ACCOUNT_AUTHORISATION_FAILED),
            "account not authorised",
        );
        assert!(!fatal.is_retryable());
    }
}
