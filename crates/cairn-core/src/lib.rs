//! Core types and error definitions for the Cairn session store.
//!
//! This crate provides the foundational types shared across the Cairn
//! crates: error handling, session metadata, checkpoint records, and
//! history events.
//!
//! # Main types
//!
//! - [`CairnError`] — Unified error enum for all store subsystems.
//! - [`CairnResult`] — Convenience alias for `Result<T, CairnError>`.
//! - [`SessionMetadata`] — Durable per-session metadata record.
//! - [`CheckpointRecord`] — One saved agent-state snapshot.
//! - [`HistoryRecord`] — One immutable event in a session's history log.

/// Error types.
pub mod error;
/// Checkpoint snapshot records.
pub mod checkpoint;
/// History event records.
pub mod history;
/// Session metadata and lifecycle status.
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointRecord};
pub use error::{CairnError, CairnResult};
pub use history::{DisplayPriority, HistoryEvent, HistoryEventType, HistoryRecord, RecordMeta};
pub use session::{SessionMetadata, SessionStatus, SessionUpdate};
