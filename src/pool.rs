//! Thread-local parser pooling.
//!
//! Every recompiled module body is parsed once, so each thread keeps one
//! JavaScript parser alive and reuses it.

use crate::module::parser::{ParserError, ScriptParser};
use std::cell::RefCell;

thread_local! {
    static SCRIPT_PARSER: RefCell<Option<ScriptParser>> = const { RefCell::new(None) };
}

/// Execute `f` with this thread's pooled parser, creating it on first use.
pub fn with_parser<F, R>(f: F) -> Result<R, ParserError>
where
    F: FnOnce(&mut ScriptParser) -> R,
{
    SCRIPT_PARSER.with(|cell| {
        let mut opt = cell.borrow_mut();
        if opt.is_none() {
            *opt = Some(ScriptParser::new()?);
        }
        Ok(f(opt.as_mut().expect("parser was just initialized above")))
    })
}
