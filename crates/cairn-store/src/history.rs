use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use cairn_core::{CairnResult, HistoryEventType, HistoryRecord};

use crate::locked::LockedSessionManager;
use crate::manager::{HistoryFilter, SessionOps};

/// How many top tools a [`SessionSummary`] ranks.
const TOP_TOOLS: usize = 5;

/// Options for [`HistoryQueries::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum matches to return.
    pub limit: Option<usize>,
    /// Match case-sensitively. Default is case-insensitive.
    pub case_sensitive: bool,
}

/// Per-tool invocation count, ranked by calls.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    /// Tool name.
    pub name: String,
    /// Times it was invoked.
    pub calls: usize,
}

/// Aggregate view of one session's history log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// The session summarized.
    pub thread_id: String,
    /// Total records in the log.
    pub total_records: usize,
    /// Record count per event type.
    pub counts_by_type: HashMap<String, usize>,
    /// Oldest record time.
    pub first_event: Option<DateTime<Utc>>,
    /// Newest record time.
    pub last_event: Option<DateTime<Utc>>,
    /// Elapsed milliseconds between oldest and newest record.
    pub span_ms: Option<i64>,
    /// Most-invoked tools, descending by call count.
    pub top_tools: Vec<ToolUsage>,
}

/// Derived, read-mostly views over session history logs, plus
/// priority-aware retention. All reads go through the locked manager so
/// they never tear against in-flight writes.
pub struct HistoryQueries {
    sessions: Arc<LockedSessionManager>,
}

impl HistoryQueries {
    /// Builds queries over the given locked manager.
    pub fn new(sessions: Arc<LockedSessionManager>) -> Self {
        Self { sessions }
    }

    /// User messages, newest-first, up to `limit`.
    pub async fn user_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> CairnResult<Vec<HistoryRecord>> {
        self.sessions
            .history(
                thread_id,
                HistoryFilter {
                    event_type: Some(HistoryEventType::UserMessage),
                    limit,
                    ..HistoryFilter::default()
                },
            )
            .await
    }

    /// Tool-call records, newest-first, up to `limit`.
    pub async fn tool_calls(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> CairnResult<Vec<HistoryRecord>> {
        self.sessions
            .history(
                thread_id,
                HistoryFilter {
                    event_type: Some(HistoryEventType::ToolCall),
                    limit,
                    ..HistoryFilter::default()
                },
            )
            .await
    }

    /// Substring search over record content, newest-first.
    pub async fn search(
        &self,
        thread_id: &str,
        query: &str,
        options: SearchOptions,
    ) -> CairnResult<Vec<HistoryRecord>> {
        let records = self
            .sessions
            .history(thread_id, HistoryFilter::default())
            .await?;
        let needle = if options.case_sensitive {
            query.to_string()
        } else {
            query.to_lowercase()
        };
        let matches = records
            .into_iter()
            .filter(|r| {
                if options.case_sensitive {
                    r.content.contains(&needle)
                } else {
                    r.content.to_lowercase().contains(&needle)
                }
            })
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(matches)
    }

    /// Aggregates counts by event type, the elapsed span between oldest
    /// and newest record, and the most frequently invoked tools.
    pub async fn summary(&self, thread_id: &str) -> CairnResult<SessionSummary> {
        let records = self
            .sessions
            .history(thread_id, HistoryFilter::default())
            .await?;

        let mut counts_by_type: HashMap<String, usize> = HashMap::new();
        let mut tool_counts: HashMap<String, usize> = HashMap::new();
        for record in &records {
            *counts_by_type.entry(event_type_key(record)).or_default() += 1;
            if let Some(name) = record.tool_name() {
                *tool_counts.entry(name.to_string()).or_default() += 1;
            }
        }

        // `history` returns newest-first.
        let first_event = records.last().map(|r| r.timestamp);
        let last_event = records.first().map(|r| r.timestamp);
        let span_ms = match (first_event, last_event) {
            (Some(first), Some(last)) => Some((last - first).num_milliseconds()),
            _ => None,
        };

        let mut top_tools: Vec<ToolUsage> = tool_counts
            .into_iter()
            .map(|(name, calls)| ToolUsage { name, calls })
            .collect();
        top_tools.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.name.cmp(&b.name)));
        top_tools.truncate(TOP_TOOLS);

        Ok(SessionSummary {
            thread_id: thread_id.to_string(),
            total_records: records.len(),
            counts_by_type,
            first_event,
            last_event,
            span_ms,
            top_tools,
        })
    }

    /// Drops records older than `older_than_days`, keeping high-priority
    /// records regardless of age when `preserve_high_priority` is set.
    /// Survivors are persisted and `message_count` reconciled. Returns
    /// records removed.
    pub async fn cleanup_history(
        &self,
        thread_id: &str,
        older_than_days: i64,
        preserve_high_priority: bool,
    ) -> CairnResult<usize> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        self.sessions
            .prune_history(thread_id, cutoff, preserve_high_priority)
            .await
    }
}

fn event_type_key(record: &HistoryRecord) -> String {
    // Reuse the wire tag so summary keys match what's in the log files.
    serde_json::to_value(record.event_type)
        .ok()
        .and_then(|v| v.as_str().map(ToString::to_string))
        .unwrap_or_else(|| format!("{:?}", record.event_type))
}
