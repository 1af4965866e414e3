use crate::cache;
use crate::rewrite::errors::RewriteError;
use crate::rewrite::lang::{expand_identifier_shorthand, javascript};
use ast_grep_core::tree_sitter::StrDoc;
use ast_grep_core::{AstGrep, NodeMatch};
use ast_grep_language::SupportLang;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One occurrence found by a [`Matcher`], with its captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCaptures {
    /// Byte range of the entire match in the text it was found in
    pub start: usize,
    pub end: usize,
    /// The matched text (`$&` in templates)
    pub text: String,
    /// Numbered groups, index 0 is group 1. Non-participating groups are `None`.
    pub groups: Vec<Option<String>>,
    /// Named groups (regex) or metavariables (structural patterns)
    pub named: BTreeMap<String, String>,
}

impl MatchCaptures {
    /// Group by 1-based index, as referenced by `$1`..`$99`.
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }

    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

/// What a replacement looks for in a module's current text.
#[derive(Clone)]
pub enum Matcher {
    /// Exact substring, no captures.
    Literal(String),
    /// Regular expression with numbered and named groups.
    Regex(Regex),
    /// ast-grep JavaScript pattern; `$NAME` metavariables become named captures.
    Structural(String),
}

impl Matcher {
    pub fn literal(text: impl Into<String>) -> Result<Self, RewriteError> {
        let text = text.into();
        if text.is_empty() {
            return Err(RewriteError::EmptyLiteral);
        }
        Ok(Matcher::Literal(text))
    }

    /// Compile a regex, expanding the `\i` identifier shorthand first.
    pub fn regex(pattern: &str) -> Result<Self, RewriteError> {
        let expanded = expand_identifier_shorthand(pattern);
        Regex::new(&expanded)
            .map(Matcher::Regex)
            .map_err(|e| RewriteError::InvalidRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
    }

    /// Validate and wrap a structural pattern.
    pub fn structural(pattern: &str) -> Result<Self, RewriteError> {
        cache::get_or_compile_pattern(pattern)?;
        Ok(Matcher::Structural(pattern.to_string()))
    }

    /// First occurrence in `text`, if any.
    pub fn find_first(&self, text: &str) -> Option<MatchCaptures> {
        match self {
            Matcher::Literal(needle) => text.find(needle.as_str()).map(|start| MatchCaptures {
                start,
                end: start + needle.len(),
                text: needle.clone(),
                groups: Vec::new(),
                named: BTreeMap::new(),
            }),
            Matcher::Regex(re) => re.captures(text).map(|caps| regex_captures(re, &caps)),
            Matcher::Structural(_) => self.find_all(text).into_iter().next(),
        }
    }

    /// Every non-overlapping occurrence, left to right.
    pub fn find_all(&self, text: &str) -> Vec<MatchCaptures> {
        match self {
            Matcher::Literal(needle) => text
                .match_indices(needle.as_str())
                .map(|(start, m)| MatchCaptures {
                    start,
                    end: start + m.len(),
                    text: m.to_string(),
                    groups: Vec::new(),
                    named: BTreeMap::new(),
                })
                .collect(),
            Matcher::Regex(re) => re
                .captures_iter(text)
                .map(|caps| regex_captures(re, &caps))
                .collect(),
            Matcher::Structural(pattern) => structural_matches(text, pattern),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Matcher::Literal(text) => format!("literal {text:?}"),
            Matcher::Regex(re) => format!("regex /{}/", re.as_str()),
            Matcher::Structural(pattern) => format!("structural `{pattern}`"),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn regex_captures(re: &Regex, caps: &regex::Captures<'_>) -> MatchCaptures {
    let whole = caps.get(0).expect("group 0 is always present in a match");
    let groups = (1..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
        .collect();
    let named = re
        .capture_names()
        .flatten()
        .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
        .collect();

    MatchCaptures {
        start: whole.start(),
        end: whole.end(),
        text: whole.as_str().to_string(),
        groups,
        named,
    }
}

fn structural_matches(text: &str, pattern: &str) -> Vec<MatchCaptures> {
    // Validated at construction; a cache eviction recompiles the same string.
    let Ok(pat) = cache::get_or_compile_pattern(pattern) else {
        return Vec::new();
    };
    let sg = AstGrep::new(text, javascript());
    let mut found: Vec<MatchCaptures> = sg
        .root()
        .find_all(&pat)
        .map(|m| node_match_to_captures(text, m))
        .collect();

    // ast-grep reports nested matches too; keep the outermost, leftmost ones.
    found.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    let mut result: Vec<MatchCaptures> = Vec::with_capacity(found.len());
    for m in found {
        if result.last().is_some_and(|prev| m.start < prev.end) {
            continue;
        }
        result.push(m);
    }
    result
}

fn node_match_to_captures(source: &str, m: NodeMatch<StrDoc<SupportLang>>) -> MatchCaptures {
    let node = m.get_node();
    let range = node.range();
    let env = m.get_env().clone();
    let captures: HashMap<String, String> = env.into();

    MatchCaptures {
        start: range.start,
        end: range.end,
        text: source[range.start..range.end].to_string(),
        groups: Vec::new(),
        named: captures.into_iter().collect(),
    }
}
