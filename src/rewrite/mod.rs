//! Text rewriting for module source.
//!
//! A [`Replacement`] pairs a [`Matcher`] (literal, regex, or ast-grep
//! structural pattern) with a [`Template`]. [`apply`] runs an ordered list of
//! replacements, each against the accumulated output of the ones before it.

pub mod errors;
pub mod lang;
pub mod matcher;
pub mod replacer;

pub use errors::{MatchMiss, ReplaceError, ReplacementThrow, RewriteError};
pub use lang::{expand_identifier_shorthand, javascript, SupportLang};
pub use matcher::{MatchCaptures, Matcher};
pub use replacer::{apply, expand_template, ApplyOutcome, ReplaceContext, Replacement, Template};
