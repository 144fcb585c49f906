use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_core::{
    CairnError, CairnResult, Checkpoint, CheckpointRecord, DisplayPriority, HistoryEvent,
    HistoryEventType, HistoryRecord, SessionMetadata, SessionStatus, SessionUpdate,
};

use crate::config::StorageConfig;
use crate::files::SessionFiles;

/// Maximum length of a title derived from the first user message.
const TITLE_MAX_CHARS: usize = 50;
/// Title used when no user message exists to derive one from.
const DEFAULT_TITLE: &str = "New session";

/// Options for metadata updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Keep `updated_at` untouched (e.g. bookkeeping that should not make
    /// a session look recently active).
    pub preserve_updated_at: bool,
}

/// Filters and pagination for history reads. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only records with this priority.
    pub priority: Option<DisplayPriority>,
    /// Only records of this event type.
    pub event_type: Option<HistoryEventType>,
    /// Only records at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Only records at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Records to skip after filtering and ordering.
    pub offset: usize,
    /// Maximum records to return.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// A filter that only restricts event type.
    pub fn event_type(event_type: HistoryEventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Self::default()
        }
    }
}

/// Filters and pagination for session listings. Results are sorted by
/// `updated_at` descending.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions with this status.
    pub status: Option<SessionStatus>,
    /// Sessions to skip after ordering.
    pub offset: usize,
    /// Maximum sessions to return.
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// A filter that only restricts status.
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// A session's metadata plus derived per-session counts.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The metadata record.
    pub metadata: SessionMetadata,
    /// Records in the checkpoint log.
    pub checkpoint_count: usize,
    /// Records in the history log.
    pub history_count: usize,
    /// On-disk size of the session directory.
    pub size_bytes: u64,
}

/// Every session operation, as a seam so the locked decorator can wrap
/// the plain manager without callers caring which they hold.
#[async_trait]
pub trait SessionOps: Send + Sync {
    /// Creates a session; writes initial metadata and, when an initial
    /// message is given, one `session_created` history record.
    async fn create_session(
        &self,
        title: Option<String>,
        language: Option<String>,
        initial_message: Option<String>,
    ) -> CairnResult<SessionMetadata>;

    /// Reads a session's metadata; `None` when absent.
    async fn get_session(&self, thread_id: &str) -> CairnResult<Option<SessionMetadata>>;

    /// Read-modify-write metadata merge; fails with `NotFound` when the
    /// session does not exist.
    async fn update_metadata(
        &self,
        thread_id: &str,
        update: SessionUpdate,
        opts: UpdateOptions,
    ) -> CairnResult<SessionMetadata>;

    /// Appends a checkpoint with the next step, updates `last_checkpoint`,
    /// then compacts the checkpoint log.
    async fn save_checkpoint(
        &self,
        thread_id: &str,
        channel_values: serde_json::Value,
        checkpoint_id: Option<String>,
    ) -> CairnResult<CheckpointRecord>;

    /// The most recent checkpoint in log order, if any.
    async fn latest_checkpoint(&self, thread_id: &str) -> CairnResult<Option<CheckpointRecord>>;

    /// Linear scan for a checkpoint by id; `None` when absent.
    async fn checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> CairnResult<Option<CheckpointRecord>>;

    /// Stamps and appends an event, recomputes `message_count` from the
    /// full log, then compacts the history log.
    async fn add_history_record(
        &self,
        thread_id: &str,
        event: HistoryEvent,
    ) -> CairnResult<HistoryRecord>;

    /// Filtered, paginated history, newest-first.
    async fn history(
        &self,
        thread_id: &str,
        filter: HistoryFilter,
    ) -> CairnResult<Vec<HistoryRecord>>;

    /// Age-based history eviction, optionally protecting high-priority
    /// records; persists survivors and reconciles `message_count`.
    /// Returns records removed.
    async fn prune_history(
        &self,
        thread_id: &str,
        cutoff: DateTime<Utc>,
        preserve_high_priority: bool,
    ) -> CairnResult<usize>;

    /// Metadata plus derived counts for one session; `None` when absent.
    async fn session_info(&self, thread_id: &str) -> CairnResult<Option<SessionInfo>>;

    /// All sessions, status-filtered, `updated_at` descending, paginated.
    async fn list_sessions(&self, filter: SessionFilter) -> CairnResult<Vec<SessionInfo>>;

    /// Marks a session archived (reversible).
    async fn archive_session(&self, thread_id: &str) -> CairnResult<()>;

    /// Restores an archived session to active.
    async fn restore_session(&self, thread_id: &str) -> CairnResult<()>;

    /// Marks a session completed (terminal apart from delete).
    async fn complete_session(&self, thread_id: &str) -> CairnResult<()>;

    /// Irreversibly deletes a session; `NotFound` when absent.
    async fn delete_session(&self, thread_id: &str) -> CairnResult<()>;

    /// Derives and persists a title from the first user message, or the
    /// default placeholder when there is none.
    async fn generate_title(&self, thread_id: &str) -> CairnResult<String>;
}

/// Session lifecycle and bookkeeping rules over [`SessionFiles`].
///
/// Not concurrency-safe on its own: callers that need atomicity against
/// concurrent operations on the same session must go through
/// [`crate::LockedSessionManager`].
#[derive(Clone)]
pub struct SessionManager {
    files: SessionFiles,
    config: StorageConfig,
}

impl SessionManager {
    /// Creates a manager over the config's base directory.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            files: SessionFiles::new(&config),
            config,
        }
    }

    /// The underlying file store.
    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    /// The active configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// All session ids on disk, unordered.
    pub async fn thread_ids(&self) -> CairnResult<Vec<String>> {
        self.files.list_sessions().await
    }

    /// Reads metadata or fails with `NotFound`.
    async fn require_session(&self, thread_id: &str) -> CairnResult<SessionMetadata> {
        self.files
            .read_metadata(thread_id)
            .await?
            .ok_or_else(|| CairnError::NotFound(thread_id.to_string()))
    }

    /// Recomputes `message_count` from the full history log. Counting the
    /// log instead of incrementing means out-of-band appends cannot make
    /// the count drift.
    async fn reconcile_message_count(&self, thread_id: &str) -> CairnResult<u64> {
        let history = self.files.read_history(thread_id).await?;
        let count = history
            .iter()
            .filter(|r| r.event_type.is_message())
            .count() as u64;
        let mut metadata = self.require_session(thread_id).await?;
        if metadata.message_count != count {
            metadata.message_count = count;
            metadata.updated_at = Utc::now();
            self.files.write_metadata(&metadata).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl SessionOps for SessionManager {
    async fn create_session(
        &self,
        title: Option<String>,
        language: Option<String>,
        initial_message: Option<String>,
    ) -> CairnResult<SessionMetadata> {
        let mut metadata = SessionMetadata::new(title.unwrap_or_else(|| DEFAULT_TITLE.to_string()));
        metadata.programming_language = language;
        metadata.validate()?;
        self.files.write_metadata(&metadata).await?;
        info!(thread_id = %metadata.thread_id, title = %metadata.title, "created session");

        if let Some(message) = initial_message {
            let event = HistoryEvent {
                event_type: HistoryEventType::SessionCreated,
                content: message,
                display_priority: DisplayPriority::Medium,
                metadata: None,
            };
            self.add_history_record(&metadata.thread_id, event).await?;
        }
        // Re-read so the returned record reflects any history bookkeeping.
        self.require_session(&metadata.thread_id).await
    }

    async fn get_session(&self, thread_id: &str) -> CairnResult<Option<SessionMetadata>> {
        self.files.read_metadata(thread_id).await
    }

    async fn update_metadata(
        &self,
        thread_id: &str,
        update: SessionUpdate,
        opts: UpdateOptions,
    ) -> CairnResult<SessionMetadata> {
        let mut metadata = self.require_session(thread_id).await?;
        metadata.apply(update, opts.preserve_updated_at);
        metadata.validate()?;
        self.files.write_metadata(&metadata).await?;
        debug!(thread_id, "updated session metadata");
        Ok(metadata)
    }

    async fn save_checkpoint(
        &self,
        thread_id: &str,
        channel_values: serde_json::Value,
        checkpoint_id: Option<String>,
    ) -> CairnResult<CheckpointRecord> {
        self.require_session(thread_id).await?;

        let existing = self.files.read_checkpoints(thread_id).await?;
        // Last retained step + 1, not count + 1: steps stay strictly
        // increasing even after compaction dropped old records.
        let step = existing.last().map_or(1, |r| r.checkpoint.step + 1);
        let id = checkpoint_id
            .unwrap_or_else(|| format!("ckpt-{}", Utc::now().timestamp_millis()));

        let record = CheckpointRecord::new(
            thread_id,
            Checkpoint {
                id: id.clone(),
                step,
                channel_values,
            },
        );
        self.files.append_checkpoint(&record).await?;

        let update = SessionUpdate {
            last_checkpoint: Some(id),
            ..SessionUpdate::default()
        };
        self.update_metadata(thread_id, update, UpdateOptions::default())
            .await?;

        self.files
            .cleanup_old_checkpoints(thread_id, self.config.max_checkpoints)
            .await?;
        debug!(thread_id, step, "saved checkpoint");
        Ok(record)
    }

    async fn latest_checkpoint(&self, thread_id: &str) -> CairnResult<Option<CheckpointRecord>> {
        let mut records = self.files.read_checkpoints(thread_id).await?;
        Ok(records.pop())
    }

    async fn checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> CairnResult<Option<CheckpointRecord>> {
        let records = self.files.read_checkpoints(thread_id).await?;
        Ok(records
            .into_iter()
            .find(|r| r.checkpoint.id == checkpoint_id))
    }

    async fn add_history_record(
        &self,
        thread_id: &str,
        event: HistoryEvent,
    ) -> CairnResult<HistoryRecord> {
        event.validate()?;
        self.require_session(thread_id).await?;

        let record = HistoryRecord::stamp(event);
        self.files.append_history(thread_id, &record).await?;
        self.files
            .cleanup_old_history(thread_id, self.config.max_history_records)
            .await?;
        // Reconcile after compaction so the count reflects the retained log.
        self.reconcile_message_count(thread_id).await?;
        debug!(thread_id, event_type = ?record.event_type, "appended history record");
        Ok(record)
    }

    async fn history(
        &self,
        thread_id: &str,
        filter: HistoryFilter,
    ) -> CairnResult<Vec<HistoryRecord>> {
        let mut records = self.files.read_history(thread_id).await?;
        records.retain(|r| {
            filter.priority.map_or(true, |p| r.display_priority == p)
                && filter.event_type.map_or(true, |t| r.event_type == t)
                && filter.since.map_or(true, |s| r.timestamp >= s)
                && filter.until.map_or(true, |u| r.timestamp <= u)
        });
        // Newest first regardless of on-disk order.
        records.reverse();
        let records = records
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(records)
    }

    async fn prune_history(
        &self,
        thread_id: &str,
        cutoff: DateTime<Utc>,
        preserve_high_priority: bool,
    ) -> CairnResult<usize> {
        self.require_session(thread_id).await?;
        let records = self.files.read_history(thread_id).await?;
        let total = records.len();
        let kept: Vec<HistoryRecord> = records
            .into_iter()
            .filter(|r| {
                r.timestamp >= cutoff
                    || (preserve_high_priority && r.display_priority == DisplayPriority::High)
            })
            .collect();
        let removed = total - kept.len();
        if removed > 0 {
            self.files.rewrite_history(thread_id, &kept).await?;
            self.reconcile_message_count(thread_id).await?;
            info!(thread_id, removed, "pruned aged history records");
        }
        Ok(removed)
    }

    async fn session_info(&self, thread_id: &str) -> CairnResult<Option<SessionInfo>> {
        let Some(metadata) = self.files.read_metadata(thread_id).await? else {
            return Ok(None);
        };
        let stats = self.files.session_stats(thread_id).await?;
        Ok(Some(SessionInfo {
            metadata,
            checkpoint_count: stats.checkpoint_count,
            history_count: stats.history_count,
            size_bytes: stats.size_bytes,
        }))
    }

    async fn list_sessions(&self, filter: SessionFilter) -> CairnResult<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        for thread_id in self.thread_ids().await? {
            // A torn metadata.json must not take down the whole listing;
            // single-session reads still surface it as a hard error.
            match self.session_info(&thread_id).await {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {}
                Err(CairnError::Corrupt { detail, .. }) => {
                    warn!(thread_id, detail, "skipping corrupt session in listing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(apply_session_filter(infos, &filter))
    }

    async fn archive_session(&self, thread_id: &str) -> CairnResult<()> {
        self.update_metadata(
            thread_id,
            SessionUpdate::status(SessionStatus::Archived),
            UpdateOptions::default(),
        )
        .await?;
        info!(thread_id, "archived session");
        Ok(())
    }

    async fn restore_session(&self, thread_id: &str) -> CairnResult<()> {
        self.update_metadata(
            thread_id,
            SessionUpdate::status(SessionStatus::Active),
            UpdateOptions::default(),
        )
        .await?;
        info!(thread_id, "restored session");
        Ok(())
    }

    async fn complete_session(&self, thread_id: &str) -> CairnResult<()> {
        self.update_metadata(
            thread_id,
            SessionUpdate::status(SessionStatus::Completed),
            UpdateOptions::default(),
        )
        .await?;
        info!(thread_id, "completed session");
        Ok(())
    }

    async fn delete_session(&self, thread_id: &str) -> CairnResult<()> {
        if !self.files.exists(thread_id).await {
            return Err(CairnError::NotFound(thread_id.to_string()));
        }
        self.files.delete_session(thread_id).await?;
        info!(thread_id, "deleted session");
        Ok(())
    }

    async fn generate_title(&self, thread_id: &str) -> CairnResult<String> {
        let history = self.files.read_history(thread_id).await?;
        let title = history
            .iter()
            .find(|r| r.event_type == HistoryEventType::UserMessage)
            .map_or_else(|| DEFAULT_TITLE.to_string(), |r| truncate_title(&r.content));
        self.update_metadata(
            thread_id,
            SessionUpdate::title(title.clone()),
            UpdateOptions::default(),
        )
        .await?;
        Ok(title)
    }
}

/// Applies status filter, `updated_at` descending sort, and pagination.
pub(crate) fn apply_session_filter(
    mut infos: Vec<SessionInfo>,
    filter: &SessionFilter,
) -> Vec<SessionInfo> {
    if let Some(status) = filter.status {
        infos.retain(|i| i.metadata.status == status);
    }
    infos.sort_by(|a, b| b.metadata.updated_at.cmp(&a.metadata.updated_at));
    infos
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect()
}

fn truncate_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head.trim_end())
    }
}
