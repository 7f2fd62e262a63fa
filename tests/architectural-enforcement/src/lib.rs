//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural
//! principles on the sideband crates:
//! - No sleep() calls in production code (wait on a condition instead)
//! - No unwrap()/expect() in production code (propagate errors)
//!
//! These tests are designed to catch violations early in the development cycle.
//! The helpers below strip comments and `#[cfg(test)]` modules so the checks
//! only see production lines.

use std::fs;
use std::path::{Path, PathBuf};

/// Source roots checked by the enforcement tests, relative to the workspace
pub const PRODUCTION_ROOTS: &[&str] = &["sideband/core/src"];

/// Workspace root, derived from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under the production roots
#[must_use]
pub fn production_sources() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_ROOTS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .map(|e| e.into_path())
        })
        .collect()
}

/// Production lines of `path` as `(line_number, code)`
///
/// Comments are cut off and everything from the first `#[cfg(test)]` on is
/// dropped; test modules sit at the end of each file.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line).to_string()))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// `path:line - code` for every production line matching `pattern`
#[must_use]
pub fn find_violations(pattern: impl Fn(&str) -> bool) -> Vec<String> {
    let mut violations = Vec::new();
    for path in production_sources() {
        for (line_number, code) in production_lines(&path) {
            if pattern(&code) {
                violations.push(format!(
                    "{}:{} - {}",
                    path.display(),
                    line_number,
                    code.trim()
                ));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_sources_found() {
        let sources = production_sources();
        assert!(sources.iter().any(|p| p.ends_with("lib.rs")));
    }

    #[test]
    fn test_test_modules_are_skipped() {
        let path = workspace_root().join("sideband/core/src/registry.rs");
        let lines = production_lines(&path);
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|(_, code)| !code.contains("#[test]")));
    }
}
