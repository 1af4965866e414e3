//! Host version gating for plugins.
//!
//! A plugin may declare the host versions it was written against, such as
//! `">=1.2.0, <1.4.0"`. Plugins whose range excludes the running host are
//! marked incompatible instead of being started against code they do not
//! understand.

use semver::{Version, VersionReq};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid host version '{value}': {message}")]
    InvalidVersion { value: String, message: String },

    #[error("invalid version requirement '{value}': {message}")]
    InvalidRequirement { value: String, message: String },
}

/// Check if `version` satisfies `requirement`. `None` or a blank requirement
/// accepts every version.
///
/// ```
/// use modpatch::plugin::version::matches_requirement;
///
/// assert!(matches_requirement("1.3.0", Some(">=1.2.0, <1.4.0")).unwrap());
/// assert!(!matches_requirement("1.4.0", Some(">=1.2.0, <1.4.0")).unwrap());
/// assert!(matches_requirement("9.0.0", None).unwrap());
/// ```
pub fn matches_requirement(
    version: &str,
    requirement: Option<&str>,
) -> Result<bool, VersionError> {
    let Some(req_str) = requirement.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(true);
    };

    let version = Version::parse(version.trim()).map_err(|e| VersionError::InvalidVersion {
        value: version.to_string(),
        message: e.to_string(),
    })?;
    let req = parse_requirement(req_str)?;

    Ok(req.matches(&version))
}

/// Validate a requirement string without a version to test it against.
pub fn parse_requirement(requirement: &str) -> Result<VersionReq, VersionError> {
    VersionReq::parse(requirement.trim()).map_err(|e| VersionError::InvalidRequirement {
        value: requirement.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_requirement_accepts_all() {
        assert!(matches_requirement("0.1.0", None).unwrap());
        assert!(matches_requirement("0.1.0", Some("  ")).unwrap());
    }

    #[test]
    fn compound_requirement() {
        let req = Some(">=1.2.0, <1.4.0");
        assert!(matches_requirement("1.2.0", req).unwrap());
        assert!(matches_requirement("1.3.9", req).unwrap());
        assert!(!matches_requirement("1.1.9", req).unwrap());
        assert!(!matches_requirement("1.4.0", req).unwrap());
    }

    #[test]
    fn caret_requirement() {
        assert!(matches_requirement("0.88.5", Some("^0.88")).unwrap());
        assert!(!matches_requirement("0.89.0", Some("^0.88")).unwrap());
    }

    #[test]
    fn invalid_inputs() {
        assert!(matches!(
            matches_requirement("banana", Some(">=1.0.0")),
            Err(VersionError::InvalidVersion { .. })
        ));
        assert!(matches!(
            matches_requirement("1.0.0", Some(">=bad")),
            Err(VersionError::InvalidRequirement { .. })
        ));
    }

    #[test]
    fn prerelease_hosts() {
        assert!(matches_requirement("2.0.0-beta.3", Some(">=2.0.0-beta.1")).unwrap());
        assert!(!matches_requirement("2.0.0-beta.3", Some(">=2.0.0")).unwrap());
    }
}
