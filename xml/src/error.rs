//! Error types for the XML codec

use thiserror::Error;

/// Result type for XML operations
pub type Result<T> = std::result::Result<T, Error>;

/// XML codec errors
#[derive(Error, Debug)]
pub enum Error {
    /// Document is not well-formed
    #[error("XML parse error: {0}")]
    Parse(String),

    /// Document is well-formed but does not have the expected shape
    #[error("unexpected document structure: {0}")]
    Structure(String),
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
