use std::path::{Path, PathBuf};

/// Resolve the project root directory.
///
/// Priority:
/// 1. `--root` flag / `XAHEEN_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.xaheen/`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
///
/// A `.xaheen/` directory that is the xaheen home itself does not mark a
/// project.
pub fn resolve_root(explicit: Option<&Path>, xaheen_home: &Path) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root(&cwd, xaheen_home)
}

fn find_root(start: &Path, xaheen_home: &Path) -> PathBuf {
    let is_project = |dir: &Path| {
        let marker = dir.join(".xaheen");
        marker.is_dir() && marker != xaheen_home
    };
    if let Some(dir) = start.ancestors().find(|d| is_project(d)) {
        return dir.to_path_buf();
    }
    if let Some(dir) = start.ancestors().find(|d| d.join(".git").is_dir()) {
        return dir.to_path_buf();
    }
    start.to_path_buf()
}
