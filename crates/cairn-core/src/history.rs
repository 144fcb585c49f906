use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CairnError, CairnResult};

/// Upper bound on history record content; longer payloads are rejected by
/// validation rather than truncated.
pub const MAX_CONTENT_LEN: usize = 100_000;

/// The kind of event a [`HistoryRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    /// A message authored by the human user.
    UserMessage,
    /// A response produced by the agent.
    AiResponse,
    /// A tool invocation performed by the agent.
    ToolCall,
    /// A context-summarization pass performed by the system.
    SystemSummarize,
    /// An error surfaced during the session.
    Error,
    /// Marker written when the session was created.
    SessionCreated,
    /// Marker written when session metadata changed out of band.
    SessionUpdated,
}

impl HistoryEventType {
    /// Whether this event counts toward `message_count`.
    pub fn is_message(self) -> bool {
        matches!(self, Self::UserMessage | Self::AiResponse)
    }
}

/// Display priority of a history record; high-priority records can be
/// protected from age-based cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayPriority {
    /// Always worth showing; protected by priority-aware cleanup.
    High,
    /// Default priority.
    Medium,
    /// Background noise, first to go.
    Low,
}

/// Event-specific structured payload, keyed by the event kind it belongs
/// to. A tagged union instead of a free-form map so each variant carries
/// only the fields relevant to its event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordMeta {
    /// Payload for [`HistoryEventType::ToolCall`].
    ToolCall {
        /// Name of the invoked tool.
        tool_name: String,
        /// Arguments passed to the tool.
        arguments: serde_json::Value,
        /// Result returned by the tool, if captured.
        result: Option<String>,
    },
    /// Payload for [`HistoryEventType::SystemSummarize`].
    Summarize {
        /// Message count before summarization.
        messages_before: u64,
        /// Message count after summarization.
        messages_after: u64,
    },
    /// Payload for [`HistoryEventType::Error`].
    Error {
        /// Coarse error classification.
        kind: String,
    },
}

/// An event not yet stamped with a timestamp; the Session Manager stamps
/// it at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// What happened.
    pub event_type: HistoryEventType,
    /// Free-text description or message content.
    pub content: String,
    /// Display priority.
    pub display_priority: DisplayPriority,
    /// Optional event-specific payload.
    pub metadata: Option<RecordMeta>,
}

impl HistoryEvent {
    /// A user message at medium priority.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            event_type: HistoryEventType::UserMessage,
            content: content.into(),
            display_priority: DisplayPriority::Medium,
            metadata: None,
        }
    }

    /// An assistant response at medium priority.
    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            event_type: HistoryEventType::AiResponse,
            content: content.into(),
            display_priority: DisplayPriority::Medium,
            metadata: None,
        }
    }

    /// A tool call with its structured payload, at low priority.
    pub fn tool_call(
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        result: Option<String>,
    ) -> Self {
        let tool_name = tool_name.into();
        Self {
            event_type: HistoryEventType::ToolCall,
            content: format!("Tool call: {tool_name}"),
            display_priority: DisplayPriority::Low,
            metadata: Some(RecordMeta::ToolCall {
                tool_name,
                arguments,
                result,
            }),
        }
    }

    /// An error event at high priority.
    pub fn error(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            event_type: HistoryEventType::Error,
            content: content.into(),
            display_priority: DisplayPriority::High,
            metadata: Some(RecordMeta::Error { kind: kind.into() }),
        }
    }

    /// Sets the display priority.
    pub fn with_priority(mut self, priority: DisplayPriority) -> Self {
        self.display_priority = priority;
        self
    }

    /// Structural validation, run before persistence.
    pub fn validate(&self) -> CairnResult<()> {
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(CairnError::Validation(format!(
                "content length {} exceeds maximum {MAX_CONTENT_LEN}",
                self.content.len()
            )));
        }
        if let Some(meta) = &self.metadata {
            let matches_event = matches!(
                (meta, self.event_type),
                (RecordMeta::ToolCall { .. }, HistoryEventType::ToolCall)
                    | (RecordMeta::Summarize { .. }, HistoryEventType::SystemSummarize)
                    | (RecordMeta::Error { .. }, HistoryEventType::Error)
            );
            if !matches_event {
                return Err(CairnError::Validation(format!(
                    "metadata variant does not match event type {:?}",
                    self.event_type
                )));
            }
        }
        Ok(())
    }
}

/// One line in a session's `history.jsonl` log. Immutable once written;
/// log order is append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Append time, millisecond epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event_type: HistoryEventType,
    /// Free-text description or message content.
    pub content: String,
    /// Display priority.
    pub display_priority: DisplayPriority,
    /// Optional event-specific payload.
    pub metadata: Option<RecordMeta>,
}

impl HistoryRecord {
    /// Stamps an event with the current time.
    pub fn stamp(event: HistoryEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event.event_type,
            content: event.content,
            display_priority: event.display_priority,
            metadata: event.metadata,
        }
    }

    /// Tool name, when this record carries a tool-call payload.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.metadata {
            Some(RecordMeta::ToolCall { tool_name, .. }) => Some(tool_name),
            _ => None,
        }
    }
}
