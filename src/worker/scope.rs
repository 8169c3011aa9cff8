//! Per-task instrumentation scope
//!
//! Entering a scope gives the task a private scratch directory, points
//! `TMPDIR` at it, moves into the suite's directory and, with coverage on,
//! picks a data file name no other task can collide with. Dropping the scope
//! puts the process-wide state back.

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::utils::CwdGuard;

#[derive(Debug)]
pub struct TaskScope {
    scratch: TempDir,
    coverage_file: Option<PathBuf>,
    worker_pid: u32,
    prior_tmpdir: Option<OsString>,
    // dropped after `Drop::drop` restores TMPDIR
    _cwd: CwdGuard,
}

impl TaskScope {
    pub fn enter(job_id: u64, workdir: &Path, coverage_dir: Option<&Path>) -> io::Result<Self> {
        let worker_pid = std::process::id();
        let scratch = tempfile::Builder::new()
            .prefix(&format!("verdant-{worker_pid}-{job_id}-"))
            .tempdir()?;

        let coverage_file = match coverage_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let suffix: u32 = rand::random();
                Some(dir.join(format!(
                    "verdant-{worker_pid}-{job_id}-{suffix:08x}-%p.profraw"
                )))
            }
            None => None,
        };

        let scope = Self {
            scratch,
            coverage_file,
            worker_pid,
            prior_tmpdir: env::var_os("TMPDIR"),
            _cwd: CwdGuard::capture(),
        };

        env::set_var("TMPDIR", scope.scratch.path());
        env::set_current_dir(workdir)?;
        debug!(
            job_id,
            scratch = %scope.scratch.path().display(),
            workdir = %workdir.display(),
            "Entered task scope"
        );
        Ok(scope)
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn coverage_file(&self) -> Option<&Path> {
        self.coverage_file.as_deref()
    }

    /// Variables every command of the task gets
    pub fn env(&self) -> Vec<(String, OsString)> {
        let mut vars = vec![
            ("TMPDIR".to_string(), self.scratch.path().as_os_str().to_owned()),
            (
                "VERDANT_SCRATCH_DIR".to_string(),
                self.scratch.path().as_os_str().to_owned(),
            ),
            (
                "VERDANT_WORKER_PID".to_string(),
                OsString::from(self.worker_pid.to_string()),
            ),
        ];
        if let Some(file) = &self.coverage_file {
            vars.push(("LLVM_PROFILE_FILE".to_string(), file.as_os_str().to_owned()));
        }
        vars
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        match self.prior_tmpdir.take() {
            Some(value) => env::set_var("TMPDIR", value),
            None => env::remove_var("TMPDIR"),
        }
        if self._cwd.saved().is_none() {
            warn!("Working directory was unreadable before the task; it cannot be restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::CWD_LOCK;

    #[test]
    fn test_scope_restores_ambient_state() {
        let _lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before_cwd = env::current_dir().unwrap();
        let before_tmp = env::var_os("TMPDIR");
        let workdir = tempfile::tempdir().unwrap();
        let workdir_path = workdir.path().canonicalize().unwrap();

        let scratch_path = {
            let scope = TaskScope::enter(1, &workdir_path, None).unwrap();
            assert_eq!(env::current_dir().unwrap().canonicalize().unwrap(), workdir_path);
            assert_eq!(env::var_os("TMPDIR").as_deref(), Some(scope.scratch_dir().as_os_str()));
            assert!(scope.coverage_file().is_none());
            scope.scratch_dir().to_path_buf()
        };

        assert_eq!(env::current_dir().unwrap(), before_cwd);
        assert_eq!(env::var_os("TMPDIR"), before_tmp);
        assert!(!scratch_path.exists());
    }

    #[test]
    fn test_coverage_files_are_unique_per_task() {
        let _lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let workdir = tempfile::tempdir().unwrap();
        let coverage = workdir.path().join("cov");

        let first = TaskScope::enter(1, workdir.path(), Some(&coverage)).unwrap();
        let first_file = first.coverage_file().unwrap().to_path_buf();
        drop(first);
        let second = TaskScope::enter(2, workdir.path(), Some(&coverage)).unwrap();
        let second_file = second.coverage_file().unwrap().to_path_buf();

        assert!(coverage.is_dir());
        assert_ne!(first_file, second_file);
        assert!(second
            .env()
            .iter()
            .any(|(k, v)| k == "LLVM_PROFILE_FILE" && v == second_file.as_os_str()));
    }
}
