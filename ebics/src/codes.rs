//! EBICS order types and return codes
//!
//! Every exchange yields two codes: a technical one from the transport
//! header and a business one from the response body. Success requires both
//! to be `000000`. Codes in the 06xxxx range are transient and worth a
//! retry; 09xxxx codes are fatal for the request that triggered them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known return codes.
pub mod retcodes {
    /// EBICS_OK
    pub const OK: &str = "000000";
    /// EBICS_AUTHENTICATION_FAILED
    pub const AUTHENTICATION_FAILED: &str = "061001";
    /// EBICS_INVALID_REQUEST
    pub const INVALID_REQUEST: &str = "061002";
    /// EBICS_INTERNAL_ERROR
    pub const INTERNAL_ERROR: &str = "061099";
    /// EBICS_INVALID_USER_OR_USER_STATE
    pub const INVALID_USER_OR_USER_STATE: &str = "091002";
    /// EBICS_ACCOUNT_AUTHORISATION_FAILED
    pub const ACCOUNT_AUTHORISATION_FAILED: &str = "090003";
    /// EBICS_INVALID_ORDER_DATA_FORMAT
    pub const INVALID_ORDER_DATA_FORMAT: &str = "090004";
    /// EBICS_NO_DOWNLOAD_DATA_AVAILABLE
    pub const NO_DOWNLOAD_DATA_AVAILABLE: &str = "090005";
    /// EBICS_PROCESSING_ERROR
    pub const PROCESSING_ERROR: &str = "091116";
}

/// One EBICS return code, kept verbatim as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnCode(String);

impl ReturnCode {
    pub fn new(code: impl Into<String>) -> Self {
        ReturnCode(code.into())
    }

    /// EBICS_OK.
    pub fn ok() -> Self {
        ReturnCode(retcodes::OK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ok(&self) -> bool {
        self.0 == retcodes::OK
    }

    /// Transient transport-class code.
    pub fn is_retryable(&self) -> bool {
        self.0.starts_with("06")
    }

    /// 090005: the date range simply held no documents.
    pub fn is_no_download_data(&self) -> bool {
        self.0 == retcodes::NO_DOWNLOAD_DATA_AVAILABLE
    }

    /// Symbolic name for logs; unknown codes print as-is.
    pub fn symbol(&self) -> &str {
        match self.0.as_str() {
            retcodes::OK => "EBICS_OK",
            retcodes::AUTHENTICATION_FAILED => "EBICS_AUTHENTICATION_FAILED",
            retcodes::INVALID_REQUEST => "EBICS_INVALID_REQUEST",
            retcodes::INTERNAL_ERROR => "EBICS_INTERNAL_ERROR",
            retcodes::INVALID_USER_OR_USER_STATE => "EBICS_INVALID_USER_OR_USER_STATE",
            retcodes::ACCOUNT_AUTHORISATION_FAILED => "EBICS_ACCOUNT_AUTHORISATION_FAILED",
            retcodes::INVALID_ORDER_DATA_FORMAT => "EBICS_INVALID_ORDER_DATA_FORMAT",
            retcodes::NO_DOWNLOAD_DATA_AVAILABLE => "EBICS_NO_DOWNLOAD_DATA_AVAILABLE",
            retcodes::PROCESSING_ERROR => "EBICS_PROCESSING_ERROR",
            other => other,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.symbol())
    }
}

/// EBICS order types this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Upload of the subscriber's signature public key
    Ini,
    /// Upload of the subscriber's authentication and encryption keys
    Hia,
    /// Download of the bank's public keys
    Hpb,
    /// Download of the subscriber's account information
    Htd,
    /// Intraday account report (camt.052)
    C52,
    /// End-of-day statement (camt.053)
    C53,
    /// SEPA credit transfer upload (pain.001)
    Cct,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Ini => "INI",
            OrderType::Hia => "HIA",
            OrderType::Hpb => "HPB",
            OrderType::Htd => "HTD",
            OrderType::C52 => "C52",
            OrderType::C53 => "C53",
            OrderType::Cct => "CCT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INI" => Some(OrderType::Ini),
            "HIA" => Some(OrderType::Hia),
            "HPB" => Some(OrderType::Hpb),
            "HTD" => Some(OrderType::Htd),
            "C52" => Some(OrderType::C52),
            "C53" => Some(OrderType::C53),
            "CCT" => Some(OrderType::Cct),
            _ => None,
        }
    }

    /// C5x payloads arrive as a ZIP of camt documents.
    pub fn is_zipped_download(&self) -> bool {
        matches!(self, OrderType::C52 | OrderType::C53)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
