//! Utility functions and helpers

mod cwd;
pub mod logger;
#[cfg(unix)]
pub mod process;
mod timer;

#[cfg(test)]
pub(crate) use cwd::CWD_LOCK;
pub use cwd::CwdGuard;
pub use logger::{init_logger, init_worker_logger, LogLevel};
pub use timer::Timer;
