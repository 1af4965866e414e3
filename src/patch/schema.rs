use crate::find::{FindCriterion, FindError};
use crate::predicate::Predicate;
use crate::rewrite::{apply, ApplyOutcome, ReplaceContext, Replacement};
use thiserror::Error;

/// A plugin's ordered set of replacements, gated by a find criterion.
#[derive(Debug, Clone)]
pub struct Patch {
    pub find: FindCriterion,
    pub replacements: Vec<Replacement>,
    /// Re-evaluated for every module against the current settings snapshot.
    pub predicate: Option<Predicate>,
    /// Name of the plugin that contributed the patch.
    pub owner: String,
    /// The host cannot run without this patch; failure is startup-fatal.
    pub required: bool,
    /// Keep applying to every matching module. Otherwise the patch is
    /// consumed by the first module it successfully patches.
    pub all: bool,
    /// Revert the whole patch if any replacement misses or fails.
    pub group: bool,
    /// Log match misses at debug level instead of warn.
    pub no_warn: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch has no owner")]
    MissingOwner,

    #[error("patch by '{owner}' has an invalid find criterion: {source}")]
    InvalidFind { owner: String, source: FindError },

    #[error("patch by '{owner}' has no replacements")]
    NoReplacements { owner: String },
}

impl Patch {
    pub fn new(owner: impl Into<String>, find: impl Into<FindCriterion>) -> Self {
        Self {
            find: find.into(),
            replacements: Vec::new(),
            predicate: None,
            owner: owner.into(),
            required: false,
            all: false,
            group: false,
            no_warn: false,
        }
    }

    pub fn replace(mut self, replacement: Replacement) -> Self {
        self.replacements.push(replacement);
        self
    }

    pub fn when(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    pub fn group(mut self) -> Self {
        self.group = true;
        self
    }

    pub fn no_warn(mut self) -> Self {
        self.no_warn = true;
        self
    }

    pub fn validate(&self) -> Result<(), PatchError> {
        if self.owner.trim().is_empty() {
            return Err(PatchError::MissingOwner);
        }
        self.find
            .validate()
            .map_err(|source| PatchError::InvalidFind {
                owner: self.owner.clone(),
                source,
            })?;
        if self.replacements.is_empty() {
            return Err(PatchError::NoReplacements {
                owner: self.owner.clone(),
            });
        }
        Ok(())
    }

    /// Run this patch's replacements over `source`.
    ///
    /// Group patches are all-or-nothing: any miss or failure discards every
    /// replacement and the returned outcome carries the input unchanged.
    pub fn apply(&self, source: &str, ctx: &ReplaceContext<'_>) -> PatchApplication {
        let outcome = apply(source, &self.replacements, ctx);

        if self.group && (!outcome.warnings.is_empty() || !outcome.errors.is_empty()) {
            return PatchApplication {
                outcome: ApplyOutcome {
                    result: source.to_string(),
                    applied_count: 0,
                    fired: vec![false; self.replacements.len()],
                    ..outcome
                },
                reverted: true,
            };
        }

        PatchApplication {
            outcome,
            reverted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchApplication {
    pub outcome: ApplyOutcome,
    /// A group patch was rolled back.
    pub reverted: bool,
}

impl PatchApplication {
    pub fn had_effect(&self) -> bool {
        self.outcome.applied_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Matcher;
    use crate::settings::SettingsSnapshot;

    fn ctx(settings: &SettingsSnapshot) -> ReplaceContext<'_> {
        ReplaceContext {
            settings,
            plugin: "P",
            self_ref: None,
        }
    }

    #[test]
    fn validate_reports_missing_parts() {
        assert_eq!(
            Patch::new("", "x").validate(),
            Err(PatchError::MissingOwner)
        );
        assert!(matches!(
            Patch::new("P", "").validate(),
            Err(PatchError::InvalidFind { .. })
        ));
        assert_eq!(
            Patch::new("P", "x").validate(),
            Err(PatchError::NoReplacements { owner: "P".into() })
        );
    }

    #[test]
    fn group_reverts_on_partial_miss() {
        let s = SettingsSnapshot::default();
        let patch = Patch::new("P", "a")
            .replace(Replacement::new(Matcher::literal("a").unwrap(), "A"))
            .replace(Replacement::new(Matcher::literal("missing").unwrap(), "M"))
            .group();

        let app = patch.apply("abc", &ctx(&s));
        assert!(app.reverted);
        assert!(!app.had_effect());
        assert_eq!(app.outcome.result, "abc");
        assert_eq!(app.outcome.warnings.len(), 1);
    }

    #[test]
    fn non_group_keeps_partial_progress() {
        let s = SettingsSnapshot::default();
        let patch = Patch::new("P", "a")
            .replace(Replacement::new(Matcher::literal("a").unwrap(), "A"))
            .replace(Replacement::new(Matcher::literal("missing").unwrap(), "M"));

        let app = patch.apply("abc", &ctx(&s));
        assert!(!app.reverted);
        assert_eq!(app.outcome.result, "Abc");
    }
}
