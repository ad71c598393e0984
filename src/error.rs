//! Error taxonomy of the monitor subsystem.
//!
//! Timeouts are ordinary `bool` returns and never appear here. Orphaned-lock
//! recovery is logged but not surfaced as an error, and debug-only
//! consistency checks panic via `debug_assert!` rather than returning.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The sync table reached the maximum index representable in the header
    /// word and cannot grow. Out-of-memory class; must not be swallowed.
    #[error("sync block table exhausted: cannot grow past {0} entries")]
    ResourceExhausted(u32),

    /// The caller broke the monitor protocol (e.g. `leave` or `wait` without
    /// owning the lock). A bug at the call site, raised synchronously.
    #[error("monitor usage violation: {0}")]
    UsageViolation(&'static str),
}

pub type Result<T> = std::result::Result<T, SyncError>;
