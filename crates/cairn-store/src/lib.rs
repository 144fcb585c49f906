//! Durable per-session storage for stateful agents.
//!
//! Each session owns a directory of three files — `metadata.json`,
//! `checkpoints.jsonl`, and `history.jsonl` — and every mutating operation
//! is serialized per session by an in-process lock table, so concurrent
//! callers on the same session never interleave read-modify-write cycles.
//!
//! Layering, bottom up: [`SessionLocks`] (keyed mutual exclusion),
//! [`SessionFiles`] (raw file I/O and compaction), [`SessionManager`]
//! (lifecycle and bookkeeping rules), [`LockedSessionManager`] (the same
//! operations under the session's lock), [`HistoryQueries`] (derived
//! read views), and [`SessionStorage`] (the facade most callers use).
//!
//! The lock table is in-process only: two processes sharing a base path
//! can still corrupt each other's files.

/// Storage configuration.
pub mod config;
/// Storage facade: stats, health, cleanup, export.
pub mod facade;
/// Raw per-session file I/O.
pub mod files;
/// Derived history queries and analytics.
pub mod history;
/// Per-key mutual exclusion.
pub mod lock;
/// Lock-decorated session manager.
pub mod locked;
/// Session lifecycle and bookkeeping.
pub mod manager;

pub use config::StorageConfig;
pub use facade::{
    CleanupOptions, CleanupReport, ExportFormat, HealthReport, HealthStatus, SessionStorage,
    SystemStats,
};
pub use files::{SessionFiles, SessionStats};
pub use history::{HistoryQueries, SearchOptions, SessionSummary, ToolUsage};
pub use lock::{LockGuard, LockStatus, SessionLocks};
pub use locked::LockedSessionManager;
pub use manager::{
    HistoryFilter, SessionFilter, SessionInfo, SessionManager, SessionOps, UpdateOptions,
};
