//! Error types for data parsing in vitals-types.

use thiserror::Error;

/// Errors that can occur when parsing engine data such as date keys.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A date key was not a valid `YYYY-MM-DD` calendar date.
    #[error("Invalid date key '{0}': expected YYYY-MM-DD")]
    InvalidDateKey(String),

    /// A value was outside the accepted range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using vitals-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
