//! Candidate gate for module patching.
//!
//! Every module the host ever registers is tested against every registered
//! patch, so this check is plain substring search. Anything heavier (regex,
//! structural patterns) belongs to the replacements, which only run once a
//! module has passed this gate.

use serde::Deserialize;
use thiserror::Error;

/// Criterion a module's source text must satisfy for a patch to be offered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FindCriterion {
    /// A single literal that must occur verbatim.
    Literal(String),
    /// Several literals that must all occur (in any order).
    Markers(Vec<String>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FindError {
    #[error("find literal is empty")]
    EmptyLiteral,

    #[error("find marker set is empty")]
    EmptyMarkerSet,

    #[error("find marker #{index} is empty")]
    EmptyMarker { index: usize },
}

impl FindCriterion {
    pub fn literal(text: impl Into<String>) -> Self {
        FindCriterion::Literal(text.into())
    }

    pub fn markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FindCriterion::Markers(markers.into_iter().map(Into::into).collect())
    }

    /// Reject criteria that would match everything or nothing meaningful.
    ///
    /// Called at registration time so that [`FindCriterion::matches`] never
    /// has an error path.
    pub fn validate(&self) -> Result<(), FindError> {
        match self {
            FindCriterion::Literal(text) if text.is_empty() => Err(FindError::EmptyLiteral),
            FindCriterion::Literal(_) => Ok(()),
            FindCriterion::Markers(markers) if markers.is_empty() => {
                Err(FindError::EmptyMarkerSet)
            }
            FindCriterion::Markers(markers) => {
                match markers.iter().position(|m| m.is_empty()) {
                    Some(index) => Err(FindError::EmptyMarker { index }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Whether `source` is a candidate for the owning patch.
    pub fn matches(&self, source: &str) -> bool {
        match self {
            FindCriterion::Literal(text) => source.contains(text.as_str()),
            FindCriterion::Markers(markers) => {
                !markers.is_empty() && markers.iter().all(|m| source.contains(m.as_str()))
            }
        }
    }

    /// Short human-readable form for logs and reports.
    pub fn describe(&self) -> String {
        match self {
            FindCriterion::Literal(text) => format!("{text:?}"),
            FindCriterion::Markers(markers) => {
                let quoted: Vec<String> = markers.iter().map(|m| format!("{m:?}")).collect();
                format!("all of [{}]", quoted.join(", "))
            }
        }
    }
}

impl From<&str> for FindCriterion {
    fn from(text: &str) -> Self {
        FindCriterion::Literal(text.to_string())
    }
}

impl From<String> for FindCriterion {
    fn from(text: String) -> Self {
        FindCriterion::Literal(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_matches_verbatim_substring() {
        let find = FindCriterion::literal("getCurrentUser");
        assert!(find.matches("function(e,t,n){n.getCurrentUser()}"));
        assert!(!find.matches("function(e,t,n){n.getcurrentuser()}"));
    }

    #[test]
    fn markers_require_every_marker() {
        let find = FindCriterion::markers(["showToast", "TOAST_TYPE"]);
        assert!(find.matches("x.showToast(y.TOAST_TYPE.SUCCESS)"));
        assert!(!find.matches("x.showToast(y)"));
    }

    #[test]
    fn marker_order_is_irrelevant() {
        let find = FindCriterion::markers(["b", "a"]);
        assert!(find.matches("a then b"));
    }

    #[test]
    fn validate_rejects_empty_criteria() {
        assert_eq!(
            FindCriterion::literal("").validate(),
            Err(FindError::EmptyLiteral)
        );
        assert_eq!(
            FindCriterion::Markers(vec![]).validate(),
            Err(FindError::EmptyMarkerSet)
        );
        assert_eq!(
            FindCriterion::markers(["ok", ""]).validate(),
            Err(FindError::EmptyMarker { index: 1 })
        );
        assert!(FindCriterion::literal("x").validate().is_ok());
    }

    #[test]
    fn empty_marker_set_never_matches() {
        assert!(!FindCriterion::Markers(vec![]).matches("anything"));
    }

    #[test]
    fn deserializes_string_or_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            find: FindCriterion,
        }

        let single: Wrapper = toml_edit::de::from_str(r#"find = "foo""#).unwrap();
        assert_eq!(single.find, FindCriterion::literal("foo"));

        let many: Wrapper = toml_edit::de::from_str(r#"find = ["a", "b"]"#).unwrap();
        assert_eq!(many.find, FindCriterion::markers(["a", "b"]));
    }
}
