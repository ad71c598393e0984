//! Per-object monitors and lazily allocated sync blocks for managed
//! runtimes with a moving collector.
//!
//! Every object carries a single packed header word ([`header::ObjectHeader`]).
//! Locking starts thin, entirely inside that word, and escalates to a
//! [`block::SyncBlock`] held in a process-wide table
//! ([`cache::SyncBlockCache`]) only when contention, wait/pulse, deep
//! recursion, or competing header state forces it. The collector hooks in
//! through [`gc::CollectorBridge`] to weak-scan the table after each
//! collection.
//!
//! ```
//! use rsmon::ObjectHeader;
//!
//! let header = ObjectHeader::new();
//! header.enter_monitor().unwrap();
//! assert!(header.owning_thread().is_some());
//! header.leave_monitor().unwrap();
//! assert!(header.owning_thread().is_none());
//! ```

pub mod block;
pub mod cache;
pub mod error;
pub mod gc;
pub mod header;
pub mod monitor;
pub mod sync;
pub mod thread;
pub mod utils;

pub use block::{ExternalMetadata, SyncBlock};
pub use cache::{configure, CacheStats, SyncBlockCache, SyncOptions};
pub use error::{Result, SyncError};
pub use gc::CollectorBridge;
pub use header::ObjectHeader;
pub use monitor::MonitorLock;
pub use thread::{thread, Thread};
