/// Launch specification for one supervised run, plus the small parsers that
/// turn presentation-layer input (a joined path string, a shell-quoted
/// argument string) into its fields.
use std::path::{Path, PathBuf};

/// Host path-list separator, as used in `PYTHONPATH`.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: char = ':';

/// Everything needed to start a run. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Absolute path of the target script.
    pub script: PathBuf,
    /// Resolved working directory. Defaults to the script's directory.
    pub cwd: PathBuf,
    /// Extra `PYTHONPATH` entries, in order. Duplicates are collapsed when
    /// the environment is built.
    pub extra_paths: Vec<PathBuf>,
    /// Extra arguments appended after the script path.
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    /// Build a spec for `script`, using the script's own directory as the
    /// working directory unless `cwd` is given. Both paths are made absolute
    /// against the current directory.
    pub fn new(script: impl Into<PathBuf>, cwd: Option<PathBuf>) -> std::io::Result<Self> {
        let script = std::path::absolute(script.into())?;
        let cwd = match cwd {
            Some(dir) => std::path::absolute(dir)?,
            None => script
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf(),
        };
        Ok(Self {
            script,
            cwd,
            extra_paths: Vec::new(),
            extra_args: Vec::new(),
        })
    }

    pub fn with_extra_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.extra_paths = paths;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Directory containing the target script.
    pub fn script_dir(&self) -> &Path {
        self.script.parent().unwrap_or(Path::new("."))
    }
}

/// Split a user-supplied path list into existing directories.
///
/// `;` is accepted as a separator on every platform (in addition to the
/// native one) so Windows-style input pastes cleanly. Entries that are empty
/// or do not name a directory are dropped.
pub fn split_path_list(raw: &str) -> Vec<PathBuf> {
    raw.replace(';', &PATH_LIST_SEPARATOR.to_string())
        .split(PATH_LIST_SEPARATOR)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .collect()
}

/// Split a shell-quoted argument string into an argument vector.
pub fn split_args(raw: &str) -> Result<Vec<String>, shell_words::ParseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    shell_words::split(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_cwd_to_script_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.py");
        std::fs::write(&script, "print('hi')\n").unwrap();

        let spec = LaunchSpec::new(&script, None).unwrap();
        assert_eq!(spec.cwd, spec.script_dir());
        assert!(spec.script.is_absolute());
    }

    #[test]
    fn test_spec_honors_explicit_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.py");
        std::fs::write(&script, "").unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let spec = LaunchSpec::new(&script, Some(work.clone())).unwrap();
        assert_eq!(spec.cwd, std::path::absolute(work).unwrap());
    }

    #[test]
    fn test_split_path_list_keeps_existing_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let raw = format!(
            "{};{}{}{}",
            a.display(),
            b.display(),
            PATH_LIST_SEPARATOR,
            dir.path().join("missing").display()
        );
        let parsed = split_path_list(&raw);
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn test_split_path_list_drops_empty_entries() {
        assert!(split_path_list("").is_empty());
        assert!(split_path_list(" ; ;; ").is_empty());
    }

    #[test]
    fn test_split_args_handles_quoting() {
        let args = split_args("--mode fast \"two words\" -n 3").unwrap();
        assert_eq!(args, vec!["--mode", "fast", "two words", "-n", "3"]);
    }

    #[test]
    fn test_split_args_empty_string() {
        assert!(split_args("").unwrap().is_empty());
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_args_unbalanced_quote_is_an_error() {
        assert!(split_args("--name \"unterminated").is_err());
    }
}
