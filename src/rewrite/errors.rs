use thiserror::Error;

/// A matcher that could not be built. Surfaced at registration time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("literal matcher is empty")]
    EmptyLiteral,

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid structural pattern {pattern:?}: {message}")]
    InvalidStructural { pattern: String, message: String },
}

/// Raised by a replacement function or template while computing new text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplaceError {
    #[error("{0}")]
    Message(String),

    #[error("template references $self but no plugin reference is available")]
    NoSelfReference,

    #[error("replacement panicked: {0}")]
    Panicked(String),
}

impl ReplaceError {
    pub fn msg(message: impl Into<String>) -> Self {
        ReplaceError::Message(message.into())
    }
}

/// Soft failure: the matcher found nothing in the current text. Usually a
/// sign that a host update moved the code a plugin targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("replacement #{index} ({matcher}) had no effect")]
pub struct MatchMiss {
    pub index: usize,
    pub matcher: String,
}

/// Hard failure isolated to one replacement: its function or template failed
/// and the affected occurrences were left untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("replacement #{index} failed on {failed_occurrences} occurrence(s): {error}")]
pub struct ReplacementThrow {
    pub index: usize,
    pub failed_occurrences: usize,
    pub error: ReplaceError,
}
