//! CPython interpreter resolution.
//!
//! The engine is a native executable with no embedded Python, so it must
//! locate a real interpreter before it can launch anything — and it must
//! never hand back its own binary, which would re-launch the supervisor
//! instead of the target. Resolution is a plain function returning a plain
//! value; callers inject the result into the [`Supervisor`] and re-resolve
//! by calling again.
//!
//! [`Supervisor`]: crate::supervisor::Supervisor

use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit interpreter path. Checked first.
pub const INTERPRETER_OVERRIDE_VAR: &str = "PROCWATCH_PYTHON";

#[cfg(windows)]
const CANDIDATE_NAMES: &[&str] = &["python.exe", "python3.exe"];
#[cfg(not(windows))]
const CANDIDATE_NAMES: &[&str] = &["python3", "python"];

/// Find an absolute path to a real CPython interpreter, or `None` if the
/// host has none we can locate. Priority order, first match wins:
///
/// 1. [`INTERPRETER_OVERRIDE_VAR`], if it names an existing file.
/// 2. Directories on the inherited `PYTHONPATH`, and each one's parent.
/// 3. The directory containing this executable.
/// 4. Windows: conventional install roots and their `python*` subdirectories.
/// 5. A `PATH` lookup of the conventional names.
pub fn resolve() -> Option<PathBuf> {
    let own_exe = std::env::current_exe().ok();

    if let Ok(raw) = std::env::var(INTERPRETER_OVERRIDE_VAR) {
        let override_path = PathBuf::from(raw.trim());
        if override_path.is_file() {
            debug!(path = %override_path.display(), "interpreter from override variable");
            return Some(override_path);
        }
    }

    if let Some(found) = scan_pythonpath_dirs(own_exe.as_deref()) {
        return Some(found);
    }

    if let Some(exe_dir) = own_exe.as_deref().and_then(Path::parent) {
        if let Some(found) = candidate_in_dir(exe_dir, own_exe.as_deref()) {
            debug!(path = %found.display(), "interpreter next to own executable");
            return Some(found);
        }
    }

    #[cfg(windows)]
    if let Some(found) = scan_windows_install_roots(own_exe.as_deref()) {
        return Some(found);
    }

    for name in CANDIDATE_NAMES {
        if let Ok(found) = which::which(name) {
            if found.is_file() && Some(found.as_path()) != own_exe.as_deref() {
                debug!(path = %found.display(), "interpreter from PATH lookup");
                return Some(found);
            }
        }
    }

    None
}

/// Probe one directory for a conventionally-named interpreter binary,
/// rejecting the engine's own executable.
fn candidate_in_dir(dir: &Path, own_exe: Option<&Path>) -> Option<PathBuf> {
    for name in CANDIDATE_NAMES {
        let full = dir.join(name);
        if full.is_file() && Some(full.as_path()) != own_exe {
            return Some(full);
        }
    }
    None
}

/// Walk the directories already named on `PYTHONPATH`. An installer may have
/// left the interpreter's own directory (or a sibling of it) on the module
/// path, so each entry's parent is probed as well.
fn scan_pythonpath_dirs(own_exe: Option<&Path>) -> Option<PathBuf> {
    let raw = std::env::var_os("PYTHONPATH")?;
    for entry in std::env::split_paths(&raw) {
        if entry.as_os_str().is_empty() || !entry.is_dir() {
            continue;
        }
        if let Some(found) = candidate_in_dir(&entry, own_exe) {
            debug!(path = %found.display(), "interpreter from PYTHONPATH entry");
            return Some(found);
        }
        if let Some(parent) = entry.parent() {
            if let Some(found) = candidate_in_dir(parent, own_exe) {
                debug!(path = %found.display(), "interpreter from PYTHONPATH parent");
                return Some(found);
            }
        }
    }
    None
}

/// Probe the conventional Windows install locations: `ProgramFiles`,
/// `ProgramFiles(x86)`, `LOCALAPPDATA\Programs`, and versioned
/// `<drive>\Python3xx` roots, each with one level of `python*` subdirectories.
#[cfg(windows)]
fn scan_windows_install_roots(own_exe: Option<&Path>) -> Option<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    for var in ["ProgramFiles", "ProgramFiles(x86)"] {
        if let Some(v) = std::env::var_os(var) {
            roots.push(PathBuf::from(v));
        }
    }
    if let Some(local) = std::env::var_os("LOCALAPPDATA") {
        roots.push(Path::new(&local).join("Programs"));
    }
    let drive = own_exe
        .and_then(|p| p.components().next().map(|c| PathBuf::from(c.as_os_str())))
        .unwrap_or_else(|| PathBuf::from("C:"));
    for ver in ["313", "312", "311", "310", "39", "38"] {
        roots.push(drive.join("\\").join(format!("Python{ver}")));
    }

    for root in roots {
        if let Some(found) = candidate_in_dir(&root, own_exe) {
            debug!(path = %found.display(), "interpreter from install root");
            return Some(found);
        }
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name
                .to_string_lossy()
                .to_ascii_lowercase()
                .starts_with("python")
            {
                if let Some(found) = candidate_in_dir(&entry.path(), own_exe) {
                    debug!(path = %found.display(), "interpreter from install subdirectory");
                    return Some(found);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test for both override behaviors: the variable is process-global,
    // so splitting these would race under the parallel test runner.
    #[test]
    fn test_override_variable() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python3");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();

        std::env::set_var(INTERPRETER_OVERRIDE_VAR, &fake);
        let resolved = resolve();
        assert_eq!(resolved.as_deref(), Some(fake.as_path()));

        // An override pointing nowhere is ignored, not returned.
        let missing = dir.path().join("missing");
        std::env::set_var(INTERPRETER_OVERRIDE_VAR, &missing);
        if let Some(path) = resolve() {
            assert_ne!(path, missing);
        }
        std::env::remove_var(INTERPRETER_OVERRIDE_VAR);
    }

    #[test]
    fn test_never_returns_own_executable() {
        if let (Some(resolved), Ok(own)) = (resolve(), std::env::current_exe()) {
            assert_ne!(resolved, own);
        }
    }

    #[test]
    fn test_candidate_in_dir_rejects_own_exe() {
        let dir = tempfile::tempdir().unwrap();
        let name = CANDIDATE_NAMES[0];
        let fake = dir.path().join(name);
        std::fs::write(&fake, "").unwrap();

        assert_eq!(
            candidate_in_dir(dir.path(), None).as_deref(),
            Some(fake.as_path())
        );
        assert!(candidate_in_dir(dir.path(), Some(&fake)).is_none());
    }
}
