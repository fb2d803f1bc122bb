//! Temporary working directories for jobs.
//!
//! [`JobScope`] is the default: a private directory that is handed to engine
//! processes explicitly and removed on drop. [`ScopedWorkDir`] additionally
//! switches the process-wide current directory, for code that can only work
//! with relative paths. Only one `ScopedWorkDir` may be active at a time.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::errors::{BridgeError, Result};

const DIR_PREFIX: &str = "engine-bridge-";

static SCOPE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A fresh empty directory owned by one job.
#[derive(Debug)]
pub struct JobScope {
    dir: TempDir,
}

impl JobScope {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
        debug!(path = %dir.path().display(), "created job directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Current directory switched into a fresh temporary directory until drop.
#[derive(Debug)]
pub struct ScopedWorkDir {
    original_cwd: PathBuf,
    temp: Option<TempDir>,
}

impl ScopedWorkDir {
    pub fn enter() -> Result<Self> {
        if SCOPE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::NestedWorkDir);
        }
        match Self::switch() {
            Ok(scope) => Ok(scope),
            Err(err) => {
                SCOPE_ACTIVE.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    fn switch() -> io::Result<Self> {
        let original_cwd = env::current_dir()?;
        let temp = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
        env::set_current_dir(temp.path())?;
        debug!(
            from = %original_cwd.display(),
            to = %temp.path().display(),
            "entered scoped working directory"
        );
        Ok(Self {
            original_cwd,
            temp: Some(temp),
        })
    }

    pub fn path(&self) -> &Path {
        self.temp
            .as_ref()
            .map(TempDir::path)
            .unwrap_or(self.original_cwd.as_path())
    }

    pub fn original_cwd(&self) -> &Path {
        &self.original_cwd
    }

    pub fn is_active() -> bool {
        SCOPE_ACTIVE.load(Ordering::Acquire)
    }
}

impl Drop for ScopedWorkDir {
    fn drop(&mut self) {
        if let Err(err) = env::set_current_dir(&self.original_cwd) {
            warn!(
                error = %err,
                path = %self.original_cwd.display(),
                "failed to restore working directory"
            );
        }
        if let Some(temp) = self.temp.take() {
            let path = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                warn!(error = %err, path = %path.display(), "failed to remove scoped directory");
            }
        }
        SCOPE_ACTIVE.store(false, Ordering::Release);
    }
}

/// Runs `job` inside a [`ScopedWorkDir`], restoring the current directory
/// and removing the scratch directory however `job` exits.
pub fn with_scoped_dir<T, E>(
    job: impl FnOnce(&Path) -> std::result::Result<T, E>,
) -> Result<std::result::Result<T, E>> {
    let scope = ScopedWorkDir::enter()?;
    let outcome = job(scope.path());
    drop(scope);
    Ok(outcome)
}
