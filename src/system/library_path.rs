//! Shared-library search path
//!
//! The backend's native libraries are resolved through the platform's
//! library search variable. [`LibraryLocator`] prepends directories to it
//! before any session is constructed.

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

/// Variable the dynamic loader consults on this platform
#[cfg(windows)]
pub const SEARCH_PATH_VAR: &str = "PATH";
#[cfg(target_os = "macos")]
pub const SEARCH_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(any(windows, target_os = "macos")))]
pub const SEARCH_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Serializes every read-modify-write of a search variable in this process.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("Cannot add {path:?} to the search path: {reason}")]
    InvalidEntry { path: PathBuf, reason: String },
    #[error("Failed to locate the running executable: {0}")]
    CurrentExe(#[from] std::io::Error),
}

/// Returns `current` with `entry` moved to the front.
///
/// Empty entries and later duplicates of `entry` are dropped; the remaining
/// entries keep their order.
pub fn prepend_entry(current: Option<&OsStr>, entry: &Path) -> Result<OsString, LocatorError> {
    let existing = current
        .map(|value| env::split_paths(value).collect::<Vec<_>>())
        .unwrap_or_default();

    let entries = std::iter::once(entry.to_path_buf()).chain(
        existing
            .into_iter()
            .filter(|p| !p.as_os_str().is_empty() && p.as_path() != entry),
    );

    env::join_paths(entries).map_err(|e| LocatorError::InvalidEntry {
        path: entry.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Edits one library search variable of the current process.
#[derive(Debug, Clone)]
pub struct LibraryLocator {
    variable: OsString,
}

impl Default for LibraryLocator {
    fn default() -> Self {
        Self::system()
    }
}

impl LibraryLocator {
    /// Locator for the platform's loader variable
    pub fn system() -> Self {
        Self::for_variable(SEARCH_PATH_VAR)
    }

    /// Locator for an arbitrary variable
    pub fn for_variable(variable: impl Into<OsString>) -> Self {
        Self {
            variable: variable.into(),
        }
    }

    pub fn variable(&self) -> &OsStr {
        &self.variable
    }

    /// Current entries of the variable, in order
    pub fn entries(&self) -> Vec<PathBuf> {
        env::var_os(&self.variable)
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default()
    }

    /// Moves `path` to the front of the search variable. Idempotent.
    ///
    /// `path` is not required to exist; a wrong directory only shows up later
    /// as a library load failure.
    pub fn prepend(&self, path: &Path) -> Result<(), LocatorError> {
        let _guard = ENV_LOCK.lock();
        let current = env::var_os(&self.variable);
        let updated = prepend_entry(current.as_deref(), path)?;
        if current.as_deref() != Some(updated.as_os_str()) {
            env::set_var(&self.variable, &updated);
            tracing::debug!("Prepended {} to {:?}", path.display(), self.variable);
        }
        Ok(())
    }

    /// Prepends the directory holding the running executable.
    pub fn prepend_executable_dir(&self) -> Result<PathBuf, LocatorError> {
        let exe = env::current_exe()?;
        let dir = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        self.prepend(&dir)?;
        Ok(dir)
    }
}

/// Prepends `path` to the platform's library search variable.
pub fn prepend_library_path<P: AsRef<Path>>(path: P) -> Result<(), LocatorError> {
    LibraryLocator::system().prepend(path.as_ref())
}
