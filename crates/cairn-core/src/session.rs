use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CairnError, CairnResult};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The session is live and accepting new records.
    Active,
    /// The session is parked; reversible via restore.
    Archived,
    /// The session finished its task and will not resume.
    Completed,
}

/// Durable per-session metadata. Exactly one record exists per session
/// directory; timestamps are serialized as millisecond epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Opaque unique identifier, assigned at creation and immutable.
    pub thread_id: String,
    /// Human-readable title (user- or system-derived).
    pub title: String,
    /// Creation time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time; always `>= created_at`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Count of user and assistant messages, reconciled from the history
    /// log on every append rather than incremented.
    pub message_count: u64,
    /// Id of the most recent checkpoint, if any.
    pub last_checkpoint: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Optional language hint for the task being worked on.
    pub programming_language: Option<String>,
    /// Optional rolling summary of the conversation.
    pub summary: Option<String>,
}

impl SessionMetadata {
    /// Creates metadata for a brand-new active session.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: generate_thread_id(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            last_checkpoint: None,
            status: SessionStatus::Active,
            programming_language: None,
            summary: None,
        }
    }

    /// Structural validation, run before persistence.
    pub fn validate(&self) -> CairnResult<()> {
        if self.thread_id.is_empty() {
            return Err(CairnError::Validation("thread_id must not be empty".into()));
        }
        if self.updated_at < self.created_at {
            return Err(CairnError::Validation(format!(
                "updated_at {} precedes created_at {}",
                self.updated_at, self.created_at
            )));
        }
        Ok(())
    }

    /// Applies a partial update, refreshing `updated_at` unless `preserve_updated_at`.
    pub fn apply(&mut self, update: SessionUpdate, preserve_updated_at: bool) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(count) = update.message_count {
            self.message_count = count;
        }
        if let Some(last) = update.last_checkpoint {
            self.last_checkpoint = Some(last);
        }
        if let Some(language) = update.programming_language {
            self.programming_language = Some(language);
        }
        if let Some(summary) = update.summary {
            self.summary = Some(summary);
        }
        if !preserve_updated_at {
            self.updated_at = Utc::now();
        }
    }
}

/// A partial metadata update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// New title.
    pub title: Option<String>,
    /// New lifecycle status.
    pub status: Option<SessionStatus>,
    /// New message count (normally set by reconciliation, not callers).
    pub message_count: Option<u64>,
    /// New last-checkpoint pointer.
    pub last_checkpoint: Option<String>,
    /// New language hint.
    pub programming_language: Option<String>,
    /// New summary.
    pub summary: Option<String>,
}

impl SessionUpdate {
    /// An update that only sets the title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// An update that only sets the status.
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Generates a fresh opaque thread id.
pub fn generate_thread_id() -> String {
    format!("thread-{}", Uuid::new_v4())
}
