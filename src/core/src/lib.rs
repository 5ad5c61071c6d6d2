//! A3S OCI Core - Foundational Types and Abstractions
//!
//! Errors, configuration, logging setup and the concurrency primitives shared
//! by the OCI store: a deadlock-free lock set and a bounded admission queue.

pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod queue;

// Re-export commonly used types
pub use config::{QueueOrder, StoreConfig, TransferConfig};
pub use error::{OciError, Result};
pub use lock::{lock_all, LockTable, MultiGuard, SharedLock};
pub use log::{init_tracing, LogConfig, LogFormat, LogLevel};
pub use queue::{Admission, AdmissionQueue, PriorityFn, QueueStatus, Transaction};

/// Re-exported so callers can build cancellation tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;

/// A3S OCI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
