//! Disposable execution contexts.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Interpreter used to run candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Interpreter program
    pub program: String,
    /// Arguments placed before the entry file
    pub args: Vec<String>,
    /// File name the candidate is written to
    pub entry_file: String,
    /// Static check command (the file path is appended). Must not execute the code.
    pub syntax_check: Option<Vec<String>>,
    /// Container image, for container backends
    pub image: String,
}

impl RuntimeSpec {
    /// Python 3 candidates.
    pub fn python() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-I".to_string()],
            entry_file: "main.py".to_string(),
            syntax_check: Some(vec![
                "python3".to_string(),
                "-c".to_string(),
                "import ast,sys; ast.parse(open(sys.argv[1]).read(), sys.argv[1])".to_string(),
            ]),
            image: "python:3.12-slim".to_string(),
        }
    }

    /// POSIX shell candidates.
    pub fn shell() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec![],
            entry_file: "main.sh".to_string(),
            syntax_check: Some(vec!["sh".to_string(), "-n".to_string()]),
            image: "busybox:stable".to_string(),
        }
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self::python()
    }
}

/// Scratch filesystem state for one sandbox run.
///
/// Layout: `<root>/code` holds the candidate and is made read-only,
/// `<root>/tmp` is the only writable directory. Dropping the context
/// removes everything.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Unique context id (container name for container backends)
    pub id: String,
    entry_file: String,
    scratch: Option<TempDir>,
}

impl ExecutionContext {
    /// Create the scratch tree, write the candidate and lock the code directory.
    pub fn prepare(code: &str, runtime: &RuntimeSpec) -> std::io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("evoloop-").tempdir()?;
        let code_dir = scratch.path().join("code");
        std::fs::create_dir(&code_dir)?;
        std::fs::create_dir(scratch.path().join("tmp"))?;

        let entry = code_dir.join(&runtime.entry_file);
        std::fs::write(&entry, code)?;

        let ctx = Self {
            id: format!("evoloop-{}", ulid::Ulid::new().to_string().to_lowercase()),
            entry_file: runtime.entry_file.clone(),
            scratch: Some(scratch),
        };
        set_readonly(&entry, true)?;
        set_readonly(&code_dir, true)?;
        debug!(context = %ctx.id, root = %ctx.root().display(), "Prepared execution context");
        Ok(ctx)
    }

    /// Scratch root.
    pub fn root(&self) -> &Path {
        match &self.scratch {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Read-only directory holding the candidate.
    pub fn code_dir(&self) -> PathBuf {
        self.root().join("code")
    }

    /// Writable temp directory for the candidate.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root().join("tmp")
    }

    /// Entry file name inside [`Self::code_dir`].
    pub fn entry_file(&self) -> &str {
        &self.entry_file
    }

    /// Full path of the entry file.
    pub fn entry_path(&self) -> PathBuf {
        self.code_dir().join(&self.entry_file)
    }

    /// Remove the scratch tree, reporting failures.
    pub fn cleanup(mut self) -> std::io::Result<()> {
        self.unlock();
        match self.scratch.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }

    fn unlock(&self) {
        if self.scratch.is_some() {
            let _ = set_readonly(&self.code_dir(), false);
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // TempDir removal needs a writable code directory.
        self.unlock();
    }
}

#[cfg(unix)]
fn set_readonly(path: &Path, readonly: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let is_dir = path.is_dir();
    let mode = match (is_dir, readonly) {
        (true, true) => 0o555,
        (true, false) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_readonly(path: &Path, readonly: bool) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_writes_readonly_code() {
        let ctx = ExecutionContext::prepare("echo hi\n", &RuntimeSpec::shell()).unwrap();
        assert_eq!(std::fs::read_to_string(ctx.entry_path()).unwrap(), "echo hi\n");
        assert!(std::fs::metadata(ctx.entry_path()).unwrap().permissions().readonly());
        assert!(ctx.tmp_dir().is_dir());
        assert!(ctx.id.starts_with("evoloop-"));
    }

    #[test]
    fn test_cleanup_and_drop_remove_tree() {
        let ctx = ExecutionContext::prepare("x", &RuntimeSpec::shell()).unwrap();
        let root = ctx.root().to_path_buf();
        ctx.cleanup().unwrap();
        assert!(!root.exists());

        let ctx = ExecutionContext::prepare("x", &RuntimeSpec::shell()).unwrap();
        let root = ctx.root().to_path_buf();
        drop(ctx);
        assert!(!root.exists());
    }
}
