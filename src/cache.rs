//! Thread-local compilation cache for structural JavaScript patterns.
//!
//! A structural replacement is evaluated against every module its patch
//! matches, so its ast-grep pattern is compiled once per thread and reused.
//! Cache is capped at 256 entries; it is cleared when full.

use crate::rewrite::errors::RewriteError;
use crate::rewrite::lang::javascript;
use ast_grep_core::Pattern;
use std::cell::RefCell;
use std::collections::HashMap;

const MAX_CACHE_ENTRIES: usize = 256;

thread_local! {
    static PATTERN_CACHE: RefCell<HashMap<String, Pattern>> =
        RefCell::new(HashMap::new());
}

/// Get a compiled pattern from cache, or compile and cache it.
pub fn get_or_compile_pattern(pattern_str: &str) -> Result<Pattern, RewriteError> {
    PATTERN_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();

        if let Some(p) = cache.get(pattern_str) {
            return Ok(p.clone());
        }

        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }

        let compiled = Pattern::try_new(pattern_str, javascript()).map_err(|e| {
            RewriteError::InvalidStructural {
                pattern: pattern_str.to_string(),
                message: e.to_string(),
            }
        })?;
        cache.insert(pattern_str.to_string(), compiled.clone());
        Ok(compiled)
    })
}

/// Clear the pattern cache (mainly for testing).
pub fn clear_cache() {
    PATTERN_CACHE.with(|cache| {
        cache.borrow_mut().clear();
    });
}

pub fn cache_size() -> usize {
    PATTERN_CACHE.with(|cache| cache.borrow().len())
}
