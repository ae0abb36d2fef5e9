//! Plugin archives: gzip-compressed tarballs with `xaheen-plugin.yaml` at
//! the root.

use crate::commands::RESERVED_OPTIONS;
use crate::error::{PluginError, Result};
use crate::paths;
use crate::types::PackageManifest;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Component, Path};

fn corrupted(name: &str, version: &str, reason: impl Into<String>) -> PluginError {
    PluginError::PackageCorrupted {
        name: name.to_string(),
        version: version.to_string(),
        reason: reason.into(),
    }
}

/// Unpack the archive for `name@version` into `dest`. Entries that would
/// land outside `dest` and link entries are rejected.
pub fn unpack(archive_path: &Path, dest: &Path, name: &str, version: &str) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest)?;

    let entries = archive
        .entries()
        .map_err(|e| corrupted(name, version, format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| corrupted(name, version, format!("unreadable entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| corrupted(name, version, format!("bad entry path: {e}")))?
            .into_owned();

        if !is_contained(&path) {
            return Err(corrupted(
                name,
                version,
                format!("entry '{}' escapes the plugin directory", path.display()),
            ));
        }
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(corrupted(
                name,
                version,
                format!("entry '{}' is a link", path.display()),
            ));
        }

        entry.unpack_in(dest).map_err(|e| {
            corrupted(
                name,
                version,
                format!("failed to unpack '{}': {e}", path.display()),
            )
        })?;
    }
    Ok(())
}

/// Read `xaheen-plugin.yaml` straight out of an archive without unpacking
/// it. Used for local archives, whose name and version are not known until
/// the package says so.
pub fn peek_manifest(archive_path: &Path) -> Result<PackageManifest> {
    let invalid = |reason: String| {
        PluginError::Validation(format!(
            "invalid plugin archive {}: {reason}",
            archive_path.display()
        ))
    };
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| invalid(format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(format!("unreadable entry: {e}")))?;
        let is_manifest = entry
            .path()
            .map(|p| {
                p.components()
                    .filter(|c| !matches!(c, Component::CurDir))
                    .eq(Path::new(paths::PACKAGE_MANIFEST_FILE).components())
            })
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let mut data = String::new();
        entry
            .read_to_string(&mut data)
            .map_err(|e| invalid(format!("unreadable {}: {e}", paths::PACKAGE_MANIFEST_FILE)))?;
        return serde_yaml::from_str(&data)
            .map_err(|e| invalid(format!("invalid {}: {e}", paths::PACKAGE_MANIFEST_FILE)));
    }
    Err(invalid(format!("missing {}", paths::PACKAGE_MANIFEST_FILE)))
}

/// A relative path made only of normal components (and `.`).
pub fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

pub fn read_package_manifest(dir: &Path, name: &str, version: &str) -> Result<PackageManifest> {
    let path = dir.join(paths::PACKAGE_MANIFEST_FILE);
    if !path.exists() {
        return Err(corrupted(
            name,
            version,
            format!("missing {}", paths::PACKAGE_MANIFEST_FILE),
        ));
    }
    let data = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&data).map_err(|e| {
        corrupted(
            name,
            version,
            format!("invalid {}: {e}", paths::PACKAGE_MANIFEST_FILE),
        )
    })
}

/// Check an unpacked package against what was requested.
pub fn validate_package(
    manifest: &PackageManifest,
    dir: &Path,
    expected_name: &str,
    expected_version: &str,
) -> Result<()> {
    if manifest.name != expected_name || manifest.version != expected_version {
        return Err(corrupted(
            expected_name,
            expected_version,
            format!("archive declares {}@{}", manifest.name, manifest.version),
        ));
    }

    let mut seen = HashSet::new();
    for cmd in &manifest.commands {
        paths::validate_name("command", &cmd.name)?;
        if !seen.insert(cmd.name.as_str()) {
            return Err(PluginError::Validation(format!(
                "{expected_name} declares command '{}' twice",
                cmd.name
            )));
        }
        let entry = Path::new(&cmd.entry);
        if cmd.entry.is_empty() || !is_contained(entry) {
            return Err(PluginError::Validation(format!(
                "command '{}' has invalid entry '{}'",
                cmd.name, cmd.entry
            )));
        }
        if !dir.join(entry).is_file() {
            return Err(PluginError::Validation(format!(
                "command '{}' entry '{}' is missing from the package",
                cmd.name, cmd.entry
            )));
        }
        let mut options = HashSet::new();
        for opt in &cmd.options {
            paths::validate_name("option", &opt.name)?;
            if RESERVED_OPTIONS.contains(&opt.name.as_str()) {
                return Err(PluginError::Validation(format!(
                    "command '{}' option '--{}' is reserved by xaheen",
                    cmd.name, opt.name
                )));
            }
            if !options.insert(opt.name.as_str()) {
                return Err(PluginError::Validation(format!(
                    "command '{}' declares option '--{}' twice",
                    cmd.name, opt.name
                )));
            }
        }
    }

    for (dep, req) in &manifest.dependencies {
        paths::validate_name("dependency", dep)?;
        crate::compat::parse_range(req)?;
    }
    if let Some(host) = &manifest.host {
        crate::compat::parse_range(host)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_archive, package_yaml};
    use tempfile::TempDir;

    #[test]
    fn unpack_and_read_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("auth.tgz");
        std::fs::write(
            &archive,
            build_archive(&[
                (
                    "xaheen-plugin.yaml",
                    package_yaml("auth", "1.0.0", &["auth"], &[]).as_str(),
                ),
                ("bin/auth.sh", "echo auth"),
            ]),
        )
        .unwrap();

        let dest = dir.path().join("out");
        unpack(&archive, &dest, "auth", "1.0.0").unwrap();
        assert!(dest.join("bin/auth.sh").is_file());

        let manifest = read_package_manifest(&dest, "auth", "1.0.0").unwrap();
        assert_eq!(manifest.command_names(), vec!["auth".to_string()]);
        validate_package(&manifest, &dest, "auth", "1.0.0").unwrap();
    }

    #[test]
    fn peek_reads_manifest_without_unpacking() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("local.tgz");
        std::fs::write(
            &archive,
            build_archive(&[
                ("bin/auth.sh", "echo auth"),
                (
                    "xaheen-plugin.yaml",
                    package_yaml("auth", "1.3.0", &["auth"], &[]).as_str(),
                ),
            ]),
        )
        .unwrap();
        let manifest = peek_manifest(&archive).unwrap();
        assert_eq!((manifest.name.as_str(), manifest.version.as_str()), ("auth", "1.3.0"));

        std::fs::write(&archive, build_archive(&[("bin/auth.sh", "echo auth")])).unwrap();
        assert!(matches!(peek_manifest(&archive), Err(PluginError::Validation(_))));
    }

    #[test]
    fn garbage_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("junk.tgz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();
        let err = unpack(&archive, &dir.path().join("out"), "junk", "1.0.0").unwrap_err();
        assert!(matches!(err, PluginError::PackageCorrupted { .. }));
    }

    #[test]
    fn name_mismatch_is_corrupted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("xaheen-plugin.yaml"),
            package_yaml("other", "1.0.0", &[], &[]),
        )
        .unwrap();
        let manifest = read_package_manifest(dir.path(), "auth", "1.0.0").unwrap();
        assert!(matches!(
            validate_package(&manifest, dir.path(), "auth", "1.0.0"),
            Err(PluginError::PackageCorrupted { .. })
        ));
    }

    #[test]
    fn missing_entry_fails_validation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("xaheen-plugin.yaml"),
            package_yaml("auth", "1.0.0", &["auth"], &[]),
        )
        .unwrap();
        let manifest = read_package_manifest(dir.path(), "auth", "1.0.0").unwrap();
        assert!(matches!(
            validate_package(&manifest, dir.path(), "auth", "1.0.0"),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn reserved_option_fails_validation() {
        let dir = TempDir::new().unwrap();
        let mut manifest = crate::test_support::package_manifest("auth", "1.0.0", &["auth"], &[]);
        manifest.commands[0].options.push(crate::types::OptionSpec {
            name: "json".to_string(),
            description: String::new(),
            takes_value: false,
            required: false,
        });
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/auth.sh"), "exit 0\n").unwrap();
        let err = validate_package(&manifest, dir.path(), "auth", "1.0.0").unwrap_err();
        assert!(err.to_string().contains("reserved"), "{err}");
    }

    #[test]
    fn containment() {
        assert!(is_contained(Path::new("bin/run.sh")));
        assert!(is_contained(Path::new("./bin/run.sh")));
        assert!(!is_contained(Path::new("../escape")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
