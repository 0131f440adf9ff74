//! Error types shared across the relay
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Lock identifier validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier too long: {len} > {max}")]
    TooLong { len: usize, max: usize },

    #[error("identifier is reserved: {0}")]
    Reserved(String),

    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Debug message construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("form data is empty")]
    EmptyForm,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid id: {0}")]
    InvalidId(#[from] IdError),
}
