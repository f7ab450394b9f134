//! Gateway error taxonomy
//!
//! One enum for the whole payment lifecycle. Every variant maps to an
//! HTTP status for the (out-of-scope) JSON boundary; protocol errors
//! carry both EBICS return codes. Transport errors and transient EBICS
//! codes are the only retryable class.

use moneta_ebics::ReturnCode;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-supplied data invalid (bad amount, missing field)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Referenced entity absent
    #[error("not found: {0}")]
    NotFound(String),

    /// The bank answered with a non-OK EBICS code
    #[error("EBICS error {technical}/{business}: {reason}")]
    Protocol {
        technical: ReturnCode,
        business: ReturnCode,
        reason: String,
    },

    /// Key handling, signing or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Malformed XML, wrong root, unexpected enum value
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation illegal in the current state (e.g. fetch before HPB)
    #[error("invalid state: {0}")]
    State(String),

    /// TCP/HTTP failure talking upstream; retryable
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// HTTP status for the JSON boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::Protocol { .. } => 502,
            Error::Crypto(_) => 500,
            Error::Parse(_) => 500,
            Error::State(_) => 409,
            Error::Transport(_) => 502,
        }
    }

    /// The business return code, when the bank produced one.
    pub fn ebics_business_code(&self) -> Option<&ReturnCode> {
        match self {
            Error::Protocol { business, .. } => Some(business),
            _ => None,
        }
    }

    /// Whether the next tick may reasonably succeed.
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

impl From<moneta_ebics::Error> for Error {
    fn from(err: moneta_ebics::Error) -> Self {
        match err {
            moneta_ebics::Error::Crypto(msg) => Error::Crypto(msg),
            moneta_ebics::Error::Xml(e) => Error::Parse(e.to_string()),
            moneta_ebics::Error::Protocol {
                technical,
                business,
                reason,
            } => Error::Protocol {
                technical,
                business,
                reason,
            },
            moneta_ebics::Error::Transport(msg) => Error::Transport(msg),
            moneta_ebics::Error::State(msg) => Error::State(msg),
        }
    }
}

impl From<moneta_iso20022::Error> for Error {
    fn from(err: moneta_iso20022::Error) -> Self {
        match err {
            moneta_iso20022::Error::Validation(msg) => Error::BadRequest(msg),
            other => Error::Parse(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moneta_ebics::retcodes;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::State("x".into()).status_code(), 409);
        assert_eq!(Error::Transport("x".into()).status_code(), 502);
    }

    #[test]
    fn protocol_errors_expose_the_business_code() {
        let err = Error::Protocol {
            technical: ReturnCode::ok(),
            business: ReturnCode::new(retcodes::ACCOUNT_AUTHORISATION_FAILED),
            reason: "nope".into(),
        };
        assert_eq!(
            err.ebics_business_code().unwrap().as_str(),
            retcodes::ACCOUNT_AUTHORISATION_FAILED
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn ebics_errors_convert_losslessly() {
        let err: Error = moneta_ebics::Error::Transport("refused".into()).into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_retryable());

        let err: Error = moneta_iso20022::Error::Validation("bad iban".into()).into();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
