//! Host-version compatibility gate.
//!
//! A plugin declares the range of host CLI versions it supports. Installing
//! outside that range is refused unless forced; a forced install carries a
//! warning and ends up recorded with `forced: true`.

use crate::error::{PluginError, Result};
use semver::{Version, VersionReq};

#[derive(Debug, Clone, PartialEq)]
pub enum Compatibility {
    Compatible,
    /// Host is outside the declared range but the caller forced the install.
    Forced { warning: String },
}

impl Compatibility {
    pub fn is_forced(&self) -> bool {
        matches!(self, Compatibility::Forced { .. })
    }
}

pub fn parse_version(raw: &str) -> Result<Version> {
    Version::parse(raw.trim())
        .map_err(|e| PluginError::Validation(format!("invalid version '{raw}': {e}")))
}

pub fn parse_range(raw: &str) -> Result<VersionReq> {
    VersionReq::parse(raw.trim())
        .map_err(|e| PluginError::Validation(format!("invalid version range '{raw}': {e}")))
}

/// Does `host` fall inside `range`? Prerelease hosts are judged by their
/// release triple so `2.0.0-beta.1` satisfies `^2`.
pub fn satisfies(range: &VersionReq, host: &Version) -> bool {
    if host.pre.is_empty() {
        range.matches(host)
    } else {
        range.matches(&Version::new(host.major, host.minor, host.patch))
    }
}

/// Gate `name@version` declaring `range` against the running `host_version`.
pub fn check(
    name: &str,
    version: &str,
    range: Option<&str>,
    host_version: &str,
    force: bool,
) -> Result<Compatibility> {
    let host = parse_version(host_version)?;
    parse_version(version)?;
    let Some(raw_range) = range.filter(|r| !r.trim().is_empty()) else {
        return Ok(Compatibility::Compatible);
    };
    let req = parse_range(raw_range)?;

    if satisfies(&req, &host) {
        return Ok(Compatibility::Compatible);
    }

    let err = PluginError::IncompatibleVersion {
        name: name.to_string(),
        version: version.to_string(),
        required: raw_range.to_string(),
        host: host_version.to_string(),
    };
    if force {
        let warning = format!("{err} (installing anyway because of --force)");
        tracing::warn!("{warning}");
        Ok(Compatibility::Forced { warning })
    } else {
        Err(err)
    }
}

/// Highest version in `candidates` matching `range`.
pub fn max_satisfying<'a>(
    range: &VersionReq,
    candidates: impl IntoIterator<Item = &'a Version>,
) -> Option<&'a Version> {
    candidates.into_iter().filter(|v| range.matches(v)).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_range_passes() {
        let c = check("auth", "1.0.0", Some(">=2.0.0, <3.0.0"), "2.4.0", false).unwrap();
        assert_eq!(c, Compatibility::Compatible);
    }

    #[test]
    fn missing_range_is_compatible() {
        assert_eq!(
            check("auth", "1.0.0", None, "2.4.0", false).unwrap(),
            Compatibility::Compatible
        );
        assert_eq!(
            check("auth", "1.0.0", Some("  "), "2.4.0", false).unwrap(),
            Compatibility::Compatible
        );
    }

    #[test]
    fn incompatible_without_force_fails() {
        let err = check("xaheen-outdated-plugin", "1.0.0", Some("^1.0.0"), "2.4.0", false)
            .unwrap_err();
        assert!(matches!(err, PluginError::IncompatibleVersion { .. }));
        assert!(err.to_string().contains("incompatible version"));
    }

    #[test]
    fn incompatible_with_force_warns() {
        let c = check("xaheen-outdated-plugin", "1.0.0", Some("^1.0.0"), "2.4.0", true).unwrap();
        assert!(c.is_forced());
        let Compatibility::Forced { warning } = c else {
            unreachable!()
        };
        assert!(warning.contains("incompatible version"));
    }

    #[test]
    fn invalid_strings_fail_fast_even_when_forced() {
        assert!(matches!(
            check("p", "1.0.0", Some("^1"), "two", true),
            Err(PluginError::Validation(_))
        ));
        assert!(matches!(
            check("p", "1.0.0", Some("not-a-range!"), "2.0.0", true),
            Err(PluginError::Validation(_))
        ));
        assert!(matches!(
            check("p", "v1", None, "2.0.0", true),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn prerelease_host_uses_release_triple() {
        let req = parse_range("^2.0.0").unwrap();
        assert!(satisfies(&req, &parse_version("2.1.0-beta.1").unwrap()));
    }

    #[test]
    fn max_satisfying_picks_highest_match() {
        let versions: Vec<Version> = ["1.0.0", "2.0.0", "2.1.0", "3.0.0"]
            .iter()
            .map(|v| Version::parse(v).unwrap())
            .collect();
        let req = parse_range("^2").unwrap();
        assert_eq!(
            max_satisfying(&req, &versions),
            Some(&Version::new(2, 1, 0))
        );
        assert_eq!(max_satisfying(&parse_range("^9").unwrap(), &versions), None);
    }
}
