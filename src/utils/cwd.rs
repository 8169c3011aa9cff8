//! Working directory save/restore

use std::env;
use std::path::PathBuf;
use tracing::warn;

/// Restores the process working directory when dropped
#[derive(Debug)]
pub struct CwdGuard {
    saved: Option<PathBuf>,
}

impl CwdGuard {
    pub fn capture() -> Self {
        let saved = match env::current_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!("Cannot read working directory: {}", e);
                None
            }
        };
        Self { saved }
    }

    pub fn saved(&self) -> Option<&PathBuf> {
        self.saved.as_ref()
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(dir) = &self.saved {
            if let Err(e) = env::set_current_dir(dir) {
                warn!("Cannot restore working directory {}: {}", dir.display(), e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
