//! JavaScript language support for matching host module source.
//!
//! Host bundles are minified JavaScript, so identifiers that plugins need to
//! capture change between builds. Regex matchers accept the `\i` shorthand
//! for "any identifier" to keep rules stable across rebuilds.

pub use ast_grep_language::SupportLang;

/// Regex fragment equivalent to the `\i` shorthand.
pub const IDENTIFIER_PATTERN: &str = r"(?:[A-Za-z_$][\w$]*)";

/// Language used for structural patterns and recompile validation.
pub fn javascript() -> SupportLang {
    SupportLang::JavaScript
}

/// Expand every unescaped `\i` into [`IDENTIFIER_PATTERN`].
///
/// Escaped backslashes are preserved, so `\\i` stays a literal backslash
/// followed by `i`.
pub fn expand_identifier_shorthand(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('i') => out.push_str(IDENTIFIER_PATTERN),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }

    out
}
