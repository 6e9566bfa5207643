//! Engine error types

use std::fmt;

/// Errors surfaced by the inspection pipeline.
///
/// Most of these are absorbed close to where they occur (a rule that
/// fails to compile is skipped, a malformed body falls back to its raw
/// form); only startup-fatal conditions propagate to the caller.
#[derive(Debug, Clone)]
pub enum WafError {
    /// A regex pattern failed to compile
    InvalidPattern {
        /// Pattern source as written in the rule file.
        pattern: String,
        /// Compiler message.
        message: String,
    },
    /// A rule-definition file could not be read or parsed
    Load(String),
    /// Request body could not be interpreted
    Body(String),
    /// Match-log sink failure
    Logging(String),
    /// Internal error
    Internal(String),
}

impl fmt::Display for WafError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, message } => {
                write!(f, "invalid pattern {pattern:?}: {message}")
            },
            Self::Load(msg) => write!(f, "rule load error: {msg}"),
            Self::Body(msg) => write!(f, "body parse error: {msg}"),
            Self::Logging(msg) => write!(f, "logging error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for WafError {}

/// Result type for WAF operations
pub type WafResult<T> = Result<T, WafError>;

impl WafError {
    /// Whether the engine may continue after this error.
    ///
    /// Everything except `Internal` is recoverable by design: the
    /// component that hit the error substitutes a best-effort value and
    /// evaluation proceeds.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}
