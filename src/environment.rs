//! Child environment construction.
//!
//! The child gets the full inherited environment with three adjustments:
//! UTF-8 stdio is forced so output decoding is stable across hosts,
//! inherited `PYTHONPATH` entries pointing into the engine's own install
//! directory are stripped (they can only be leftovers meant for the engine,
//! not for an external interpreter), and a computed module search path is
//! prepended — the script directory, the working directory, any
//! caller-supplied extras, and every directory under the working tree that
//! directly contains a `.py` file.

use crate::launch::{LaunchSpec, PATH_LIST_SEPARATOR};
use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Fixed variables forcing UTF-8 stdio in the child, regardless of host
/// locale or Windows code page.
pub const FORCED_UTF8_VARS: [(&str, &str); 3] = [
    ("PYTHONUTF8", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONLEGACYWINDOWSSTDIO", "0"),
];

/// Directory names never descended into when scanning for source
/// directories: caches, version control, dependency trees, build output.
pub const SKIP_DIRS: &[&str] = &[
    "__pycache__",
    ".git",
    "node_modules",
    "venv",
    ".venv",
    "env",
    ".env",
    "dist",
    "build",
];

/// Build the complete environment mapping for the child process.
pub fn build_env(spec: &LaunchSpec) -> HashMap<OsString, OsString> {
    let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();

    for (key, value) in FORCED_UTF8_VARS {
        env.insert(key.into(), value.into());
    }

    let inherited = env
        .get(OsStr::new("PYTHONPATH"))
        .map(|raw| strip_own_install_entries(raw))
        .unwrap_or_default();

    let mut paths: Vec<PathBuf> = vec![spec.script_dir().to_path_buf(), spec.cwd.clone()];
    paths.extend(spec.extra_paths.iter().cloned());
    paths.extend(discover_source_dirs(&spec.cwd));

    let joined = join_unique(&paths, &inherited);
    env.insert("PYTHONPATH".into(), joined);
    env
}

/// Drop inherited `PYTHONPATH` entries that live under the directory of the
/// engine's own executable.
fn strip_own_install_entries(raw: &OsStr) -> Vec<PathBuf> {
    let own_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    std::env::split_paths(raw)
        .filter(|entry| !entry.as_os_str().is_empty())
        .filter(|entry| match &own_dir {
            Some(dir) => !entry.starts_with(dir),
            None => true,
        })
        .collect()
}

/// Recursively find every directory under `root` that directly contains a
/// `.py` file, in walk order. Hidden directories, [`SKIP_DIRS`] and
/// `*.egg-info` packaging metadata are pruned.
pub fn discover_source_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref()) && !name.ends_with(".egg-info")
    });
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension() == Some(OsStr::new("py")) {
            if let Some(parent) = entry.path().parent() {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs
}

/// De-duplicate `paths` preserving first-seen order, join with the host
/// separator, and append the surviving inherited entries after them. The
/// inherited value is never discarded.
fn join_unique(paths: &[PathBuf], inherited: &[PathBuf]) -> OsString {
    let mut seen: HashSet<&Path> = HashSet::new();
    let mut joined = OsString::new();
    for path in paths.iter().chain(inherited) {
        if !seen.insert(path.as_path()) {
            continue;
        }
        if !joined.is_empty() {
            joined.push(PATH_LIST_SEPARATOR.to_string());
        }
        joined.push(path.as_os_str());
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(dir: &Path) -> LaunchSpec {
        let script = dir.join("main.py");
        std::fs::write(&script, "print('x')\n").unwrap();
        LaunchSpec::new(script, Some(dir.to_path_buf())).unwrap()
    }

    fn pythonpath_entries(env: &HashMap<OsString, OsString>) -> Vec<PathBuf> {
        std::env::split_paths(&env[OsStr::new("PYTHONPATH")]).collect()
    }

    #[test]
    fn test_utf8_vars_are_forced() {
        let dir = tempfile::tempdir().unwrap();
        let env = build_env(&spec_for(dir.path()));
        for (key, value) in FORCED_UTF8_VARS {
            assert_eq!(env[OsStr::new(key)], OsString::from(value), "{key}");
        }
    }

    #[test]
    fn test_source_dirs_are_discovered_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg/sub")).unwrap();
        std::fs::write(root.join("pkg/mod.py"), "").unwrap();
        std::fs::write(root.join("pkg/sub/deep.py"), "").unwrap();
        std::fs::create_dir(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/data.txt"), "").unwrap();
        for skipped in ["__pycache__", ".git", "venv", "build", "pw.egg-info", ".hidden"] {
            std::fs::create_dir(root.join(skipped)).unwrap();
            std::fs::write(root.join(skipped).join("x.py"), "").unwrap();
        }

        let dirs = discover_source_dirs(root);
        assert!(dirs.contains(&root.join("pkg")));
        assert!(dirs.contains(&root.join("pkg/sub")));
        assert!(!dirs.contains(&root.join("assets")));
        for skipped in ["__pycache__", ".git", "venv", "build", "pw.egg-info", ".hidden"] {
            assert!(!dirs.contains(&root.join(skipped)), "{skipped} not pruned");
        }
    }

    #[test]
    fn test_pythonpath_starts_with_script_dir_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let env = build_env(&spec_for(dir.path()));
        let entries = pythonpath_entries(&env);
        let expected = std::path::absolute(dir.path()).unwrap();
        // Script dir and cwd are the same here, so it appears exactly once
        // at the front.
        assert_eq!(entries[0], expected);
        assert_eq!(entries.iter().filter(|e| **e == expected).count(), 1);
    }

    #[test]
    fn test_duplicate_extra_paths_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("lib");
        std::fs::create_dir(&extra).unwrap();
        std::fs::write(extra.join("helper.py"), "").unwrap();

        let spec = spec_for(dir.path())
            .with_extra_paths(vec![extra.clone(), extra.clone(), extra.clone()]);
        let env = build_env(&spec);
        let entries = pythonpath_entries(&env);
        // Supplied three times and discovered once by the scan; one entry
        // survives.
        assert_eq!(entries.iter().filter(|e| **e == extra).count(), 1);
    }

    #[test]
    fn test_inherited_pythonpath_is_appended_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let inherited = dir.path().join("inherited");
        std::fs::create_dir(&inherited).unwrap();

        std::env::set_var("PYTHONPATH", &inherited);
        let env = build_env(&spec_for(dir.path()));
        std::env::remove_var("PYTHONPATH");

        let entries = pythonpath_entries(&env);
        let pos_inherited = entries.iter().position(|e| *e == inherited);
        let expected_front = std::path::absolute(dir.path()).unwrap();
        let pos_front = entries.iter().position(|e| *e == expected_front);
        assert!(pos_inherited.is_some(), "inherited entry kept");
        assert!(pos_front.unwrap() < pos_inherited.unwrap(), "inherited comes last");
    }

    #[test]
    fn test_entries_under_own_install_dir_are_stripped() {
        let own_dir = std::env::current_exe().unwrap();
        let own_dir = own_dir.parent().unwrap();
        let raw: OsString = own_dir.join("leftover").into();
        assert!(strip_own_install_entries(&raw).is_empty());

        let other: OsString = "/somewhere/else".into();
        assert_eq!(
            strip_own_install_entries(&other),
            vec![PathBuf::from("/somewhere/else")]
        );
    }
}
