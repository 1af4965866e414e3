use crate::predicate::Predicate;
use crate::rewrite::errors::{MatchMiss, ReplaceError, ReplacementThrow};
use crate::rewrite::matcher::{MatchCaptures, Matcher};
use crate::settings::SettingsSnapshot;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type ReplaceFn = Arc<dyn Fn(&MatchCaptures) -> Result<String, ReplaceError> + Send + Sync>;

/// How the new text for one occurrence is produced.
#[derive(Clone)]
pub enum Template {
    /// Substitution string. Supports `$&`, `$1`..`$99`, `$<name>`, `$$` and
    /// `$self` (the owning plugin's reference expression).
    Literal(String),
    /// Pure function of the match.
    Function(ReplaceFn),
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Template::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Template::Function(_) => write!(f, "Function(<fn>)"),
        }
    }
}

/// A single find/replace rule inside a patch.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub matcher: Matcher,
    pub template: Template,
    /// Replace every non-overlapping occurrence instead of only the first.
    pub global: bool,
    pub applies_if: Option<Predicate>,
}

impl Replacement {
    pub fn new(matcher: Matcher, replacement: impl Into<String>) -> Self {
        Self {
            matcher,
            template: Template::Literal(replacement.into()),
            global: false,
            applies_if: None,
        }
    }

    pub fn with_fn<F>(matcher: Matcher, f: F) -> Self
    where
        F: Fn(&MatchCaptures) -> Result<String, ReplaceError> + Send + Sync + 'static,
    {
        Self {
            matcher,
            template: Template::Function(Arc::new(f)),
            global: false,
            applies_if: None,
        }
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn when(mut self, predicate: Predicate) -> Self {
        self.applies_if = Some(predicate);
        self
    }

    fn render(&self, caps: &MatchCaptures, ctx: &ReplaceContext<'_>) -> Result<String, ReplaceError> {
        let rendered = catch_unwind(AssertUnwindSafe(|| match &self.template {
            Template::Literal(template) => expand_template(template, caps, ctx.self_ref),
            Template::Function(f) => f(caps),
        }));
        rendered.unwrap_or_else(|payload| Err(ReplaceError::Panicked(panic_message(payload.as_ref()))))
    }
}

/// Inputs replacements may depend on besides the text itself.
#[derive(Debug, Clone, Copy)]
pub struct ReplaceContext<'a> {
    pub settings: &'a SettingsSnapshot,
    /// Plugin that owns the replacements; scope for unqualified predicates.
    pub plugin: &'a str,
    /// Expression `$self` expands to.
    pub self_ref: Option<&'a str>,
}

/// Result of running an ordered replacement list over one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub result: String,
    /// Number of replacements that substituted at least one occurrence.
    pub applied_count: usize,
    /// Per replacement: whether it substituted anything.
    pub fired: Vec<bool>,
    pub errors: Vec<ReplacementThrow>,
    pub warnings: Vec<MatchMiss>,
}

impl ApplyOutcome {
    pub fn changed(&self, original: &str) -> bool {
        self.result != original
    }
}

/// Apply `replacements` in order, each against the output of the previous.
///
/// Skipped replacements (`applies_if` false) are neither fired nor warned.
/// A matcher that finds nothing yields a [`MatchMiss`]; a failing template
/// yields a [`ReplacementThrow`] and leaves those occurrences untouched.
pub fn apply(source: &str, replacements: &[Replacement], ctx: &ReplaceContext<'_>) -> ApplyOutcome {
    let mut current = source.to_string();
    let mut fired = vec![false; replacements.len()];
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (index, replacement) in replacements.iter().enumerate() {
        if let Some(predicate) = &replacement.applies_if {
            if !predicate.evaluate(ctx.settings, ctx.plugin) {
                continue;
            }
        }

        let occurrences = if replacement.global {
            replacement.matcher.find_all(&current)
        } else {
            replacement.matcher.find_first(&current).into_iter().collect()
        };

        if occurrences.is_empty() {
            warnings.push(MatchMiss {
                index,
                matcher: replacement.matcher.describe(),
            });
            continue;
        }

        let mut next = String::with_capacity(current.len());
        let mut cursor = 0;
        let mut substituted = 0;
        let mut failed = 0;
        let mut first_error = None;

        for caps in &occurrences {
            next.push_str(&current[cursor..caps.start]);
            match replacement.render(caps, ctx) {
                Ok(text) => {
                    next.push_str(&text);
                    substituted += 1;
                }
                Err(err) => {
                    next.push_str(&caps.text);
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
            cursor = caps.end;
        }
        next.push_str(&current[cursor..]);

        if let Some(error) = first_error {
            errors.push(ReplacementThrow {
                index,
                failed_occurrences: failed,
                error,
            });
        }
        if substituted > 0 {
            fired[index] = true;
            current = next;
        }
    }

    ApplyOutcome {
        result: current,
        applied_count: fired.iter().filter(|f| **f).count(),
        fired,
        errors,
        warnings,
    }
}

/// Expand a substitution string against one match.
///
/// References to groups that exist but did not participate expand to the
/// empty string; `$n` past the last group is kept literally.
pub fn expand_template(
    template: &str,
    caps: &MatchCaptures,
    self_ref: Option<&str>,
) -> Result<String, ReplaceError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            let ch = template[i..].chars().next().expect("index is on a char boundary");
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        let rest = &template[i + 1..];
        if rest.starts_with("self") {
            out.push_str(self_ref.ok_or(ReplaceError::NoSelfReference)?);
            i += 1 + "self".len();
        } else if rest.starts_with('$') {
            out.push('$');
            i += 2;
        } else if rest.starts_with('&') {
            out.push_str(&caps.text);
            i += 2;
        } else if rest.starts_with('<') {
            match rest.find('>') {
                Some(close) => {
                    out.push_str(caps.name(&rest[1..close]).unwrap_or(""));
                    i += 1 + close + 1;
                }
                None => {
                    out.push('$');
                    i += 1;
                }
            }
        } else if let Some((index, len)) = group_reference(rest, caps.groups.len()) {
            out.push_str(caps.group(index).unwrap_or(""));
            i += 1 + len;
        } else {
            out.push('$');
            i += 1;
        }
    }

    Ok(out)
}

/// Parse `NN` or `N` after a `$`, preferring two digits when that group exists.
fn group_reference(rest: &str, group_count: usize) -> Option<(usize, usize)> {
    let digits: Vec<usize> = rest
        .chars()
        .take(2)
        .map_while(|c| c.to_digit(10).map(|d| d as usize))
        .collect();

    if digits.len() == 2 {
        let two = digits[0] * 10 + digits[1];
        if two >= 1 && two <= group_count {
            return Some((two, 2));
        }
    }
    match digits.first() {
        Some(&one) if one >= 1 && one <= group_count => Some((one, 1)),
        _ => None,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsStore;

    fn ctx(settings: &SettingsSnapshot) -> ReplaceContext<'_> {
        ReplaceContext {
            settings,
            plugin: "Test",
            self_ref: Some("modpatch.plugins[\"Test\"]"),
        }
    }

    fn lit(s: &str) -> Matcher {
        Matcher::literal(s).unwrap()
    }

    #[test]
    fn first_only_by_default() {
        let s = SettingsSnapshot::default();
        let out = apply("ab ab ab", &[Replacement::new(lit("ab"), "X")], &ctx(&s));
        assert_eq!(out.result, "X ab ab");
        assert_eq!(out.applied_count, 1);
    }

    #[test]
    fn global_replaces_every_occurrence() {
        let s = SettingsSnapshot::default();
        let out = apply(
            "ab ab ab",
            &[Replacement::new(lit("ab"), "X").global()],
            &ctx(&s),
        );
        assert_eq!(out.result, "X X X");
    }

    #[test]
    fn later_replacements_see_earlier_output() {
        let s = SettingsSnapshot::default();
        let out = apply(
            "foo",
            &[
                Replacement::new(lit("foo"), "bar"),
                Replacement::new(lit("bar"), "baz"),
            ],
            &ctx(&s),
        );
        assert_eq!(out.result, "baz");
        assert_eq!(out.fired, vec![true, true]);
    }

    #[test]
    fn miss_is_a_warning_not_an_error() {
        let s = SettingsSnapshot::default();
        let out = apply("abc", &[Replacement::new(lit("zzz"), "y")], &ctx(&s));
        assert_eq!(out.result, "abc");
        assert!(out.errors.is_empty());
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].index, 0);
    }

    #[test]
    fn failing_function_is_isolated() {
        let s = SettingsSnapshot::default();
        let out = apply(
            "a b c",
            &[
                Replacement::new(lit("a"), "A"),
                Replacement::with_fn(lit("b"), |_| Err(ReplaceError::msg("boom"))),
                Replacement::new(lit("c"), "C"),
            ],
            &ctx(&s),
        );
        assert_eq!(out.result, "A b C");
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].index, 1);
        assert_eq!(out.errors[0].error, ReplaceError::msg("boom"));
    }

    #[test]
    fn panicking_function_is_caught() {
        let s = SettingsSnapshot::default();
        let out = apply(
            "a",
            &[Replacement::with_fn(lit("a"), |_| panic!("kaboom"))],
            &ctx(&s),
        );
        assert_eq!(out.result, "a");
        assert_eq!(
            out.errors[0].error,
            ReplaceError::Panicked("kaboom".to_string())
        );
    }

    #[test]
    fn global_failure_keeps_failed_occurrences_only() {
        let s = SettingsSnapshot::default();
        let r = Replacement::with_fn(Matcher::regex(r"\d").unwrap(), |caps| {
            if caps.text == "2" {
                Err(ReplaceError::msg("two"))
            } else {
                Ok("#".to_string())
            }
        })
        .global();
        let out = apply("1 2 3", &[r], &ctx(&s));
        assert_eq!(out.result, "# 2 #");
        assert_eq!(out.errors[0].failed_occurrences, 1);
        assert!(out.fired[0]);
    }

    #[test]
    fn predicate_skips_without_warning() {
        let mut store = SettingsStore::new();
        store.set("Test", "on", false);
        let s = store.snapshot();
        let out = apply(
            "abc",
            &[Replacement::new(lit("a"), "A").when(Predicate::setting("on"))],
            &ctx(&s),
        );
        assert_eq!(out.result, "abc");
        assert!(out.warnings.is_empty());
        assert_eq!(out.fired, vec![false]);
    }

    #[test]
    fn template_substitutions() {
        let caps = MatchCaptures {
            start: 0,
            end: 5,
            text: "e.x(1)".into(),
            groups: vec![Some("e".into()), None, Some("1".into())],
            named: [("arg".to_string(), "1".to_string())].into_iter().collect(),
        };
        let out = expand_template("[$&|$1|$2|$3|$<arg>|$$|$9|$self]", &caps, Some("P")).unwrap();
        assert_eq!(out, "[e.x(1)|e||1|1|$|$9|P]");
    }

    #[test]
    fn self_without_reference_fails() {
        let caps = MatchCaptures {
            start: 0,
            end: 0,
            text: String::new(),
            groups: vec![],
            named: Default::default(),
        };
        assert_eq!(
            expand_template("$self.run()", &caps, None),
            Err(ReplaceError::NoSelfReference)
        );
    }

    #[test]
    fn regex_template_uses_groups() {
        let s = SettingsSnapshot::default();
        let r = Replacement::new(
            Matcher::regex(r"(\i)\.isStaff\(\)").unwrap(),
            "($1.isStaff()||$self.force)",
        );
        let out = apply("if(u.isStaff())go()", &[r], &ctx(&s));
        assert_eq!(
            out.result,
            "if((u.isStaff()||modpatch.plugins[\"Test\"].force))go()"
        );
    }

    #[test]
    fn structural_replacement_with_metavariables() {
        let s = SettingsSnapshot::default();
        let r = Replacement::new(
            Matcher::structural("$OBJ.track($EVT)").unwrap(),
            "void 0",
        );
        let out = apply("(function(){ a.track(\"x\"); return 2 })", &[r], &ctx(&s));
        assert_eq!(out.result, "(function(){ void 0; return 2 })");
    }
}
