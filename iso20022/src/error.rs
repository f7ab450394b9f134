//! Error types for the ISO 20022 translator

use thiserror::Error;

/// Result type for translator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Translator errors
#[derive(Error, Debug)]
pub enum Error {
    /// camt document malformed or outside the supported shapes
    #[error("camt parse error: {0}")]
    CamtParse(String),

    /// pain.001 malformed
    #[error("pain.001 parse error: {0}")]
    PainParse(String),

    /// Caller-supplied payment data invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// Underlying XML problem
    #[error("XML error: {0}")]
    Xml(#[from] moneta_xml::Error),
}
