use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A saved snapshot of the agent's working state at one execution step.
///
/// `channel_values` is opaque to the store: whatever state the agent graph
/// carries (messages, task context, retry counters) is serialized as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Caller-supplied or time-derived checkpoint identifier.
    pub id: String,
    /// Strictly increasing per session. Compaction may drop old records,
    /// so steps stay monotonic but need not be contiguous from 1.
    pub step: u64,
    /// Opaque agent state snapshot.
    pub channel_values: serde_json::Value,
}

/// One line in a session's `checkpoints.jsonl` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Append time, millisecond epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Owning session.
    pub thread_id: String,
    /// The snapshot itself.
    pub checkpoint: Checkpoint,
}

impl CheckpointRecord {
    /// Creates a record stamped with the current time.
    pub fn new(thread_id: impl Into<String>, checkpoint: Checkpoint) -> Self {
        Self {
            timestamp: Utc::now(),
            thread_id: thread_id.into(),
            checkpoint,
        }
    }
}
