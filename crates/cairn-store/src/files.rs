use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use cairn_core::{CairnError, CairnResult, CheckpointRecord, HistoryRecord, SessionMetadata};

use crate::config::StorageConfig;

/// Raw durable I/O for session directories.
///
/// Maps a thread id to `<base>/sessions/<thread_id>/` holding
/// `metadata.json`, `checkpoints.jsonl`, and `history.jsonl`. Keeps no
/// state beyond the configured base path; all consistency rules live in
/// the session manager above it. Callers that bypass the locked manager
/// also bypass its exclusivity guarantee.
#[derive(Clone)]
pub struct SessionFiles {
    sessions_dir: PathBuf,
}

/// Per-session on-disk statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Number of checkpoint records in the log.
    pub checkpoint_count: usize,
    /// Number of history records in the log.
    pub history_count: usize,
    /// Most recent mtime across the session's files.
    pub last_modified: Option<DateTime<Utc>>,
    /// Total on-disk size of the session directory.
    pub size_bytes: u64,
}

impl SessionFiles {
    /// Creates a store rooted at the config's base directory. Directories
    /// are created lazily on first write.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            sessions_dir: config.sessions_dir(),
        }
    }

    /// Directory for one session.
    pub fn session_dir(&self, thread_id: &str) -> PathBuf {
        self.sessions_dir.join(thread_id)
    }

    fn metadata_path(&self, thread_id: &str) -> PathBuf {
        self.session_dir(thread_id).join("metadata.json")
    }

    fn checkpoints_path(&self, thread_id: &str) -> PathBuf {
        self.session_dir(thread_id).join("checkpoints.jsonl")
    }

    fn history_path(&self, thread_id: &str) -> PathBuf {
        self.session_dir(thread_id).join("history.jsonl")
    }

    /// Ensures the sessions root exists.
    pub async fn ensure_root(&self) -> CairnResult<()> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        Ok(())
    }

    async fn ensure_session_dir(&self, thread_id: &str) -> CairnResult<()> {
        tokio::fs::create_dir_all(self.session_dir(thread_id)).await?;
        Ok(())
    }

    /// Whether a metadata record exists for this session.
    pub async fn exists(&self, thread_id: &str) -> bool {
        tokio::fs::try_exists(self.metadata_path(thread_id))
            .await
            .unwrap_or(false)
    }

    /// Reads a session's metadata.
    ///
    /// A missing file is `Ok(None)`. Empty or unparsable content is
    /// [`CairnError::Corrupt`] — a torn write is reported, not silently
    /// treated as an absent session.
    pub async fn read_metadata(&self, thread_id: &str) -> CairnResult<Option<SessionMetadata>> {
        let path = self.metadata_path(thread_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Err(CairnError::Corrupt {
                thread_id: thread_id.to_string(),
                detail: "metadata.json is empty".into(),
            });
        }
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| CairnError::Corrupt {
                thread_id: thread_id.to_string(),
                detail: format!("metadata.json: {e}"),
            })
    }

    /// Writes (replaces) a session's metadata, creating the session
    /// directory if needed.
    pub async fn write_metadata(&self, metadata: &SessionMetadata) -> CairnResult<()> {
        self.ensure_session_dir(&metadata.thread_id).await?;
        let json = serde_json::to_string_pretty(metadata)?;
        tokio::fs::write(self.metadata_path(&metadata.thread_id), json).await?;
        Ok(())
    }

    /// Appends one checkpoint record to the session's log.
    pub async fn append_checkpoint(&self, record: &CheckpointRecord) -> CairnResult<()> {
        self.ensure_session_dir(&record.thread_id).await?;
        append_line(&self.checkpoints_path(&record.thread_id), record).await
    }

    /// Appends one history record to the session's log.
    pub async fn append_history(
        &self,
        thread_id: &str,
        record: &HistoryRecord,
    ) -> CairnResult<()> {
        self.ensure_session_dir(thread_id).await?;
        append_line(&self.history_path(thread_id), record).await
    }

    /// Reads the whole checkpoint log, oldest first. Missing file yields
    /// an empty vec; unparsable lines are skipped with a warning.
    pub async fn read_checkpoints(&self, thread_id: &str) -> CairnResult<Vec<CheckpointRecord>> {
        read_lines(&self.checkpoints_path(thread_id), thread_id, "checkpoints").await
    }

    /// Reads the whole history log, oldest first. Missing file yields an
    /// empty vec; unparsable lines are skipped with a warning.
    pub async fn read_history(&self, thread_id: &str) -> CairnResult<Vec<HistoryRecord>> {
        read_lines(&self.history_path(thread_id), thread_id, "history").await
    }

    /// Rewrites the history log with exactly the given records.
    pub async fn rewrite_history(
        &self,
        thread_id: &str,
        records: &[HistoryRecord],
    ) -> CairnResult<()> {
        self.ensure_session_dir(thread_id).await?;
        rewrite_log(&self.history_path(thread_id), records).await
    }

    /// Drops the oldest checkpoints so at most `keep` remain. A count
    /// already within the limit is a no-op. Returns records removed.
    pub async fn cleanup_old_checkpoints(
        &self,
        thread_id: &str,
        keep: usize,
    ) -> CairnResult<usize> {
        let records = self.read_checkpoints(thread_id).await?;
        if records.len() <= keep {
            return Ok(0);
        }
        let removed = records.len() - keep;
        let kept = &records[removed..];
        rewrite_log(&self.checkpoints_path(thread_id), kept).await?;
        debug!(thread_id, removed, keep, "compacted checkpoint log");
        Ok(removed)
    }

    /// Drops the oldest history records so at most `keep` remain. A count
    /// already within the limit is a no-op. Returns records removed.
    pub async fn cleanup_old_history(&self, thread_id: &str, keep: usize) -> CairnResult<usize> {
        let records = self.read_history(thread_id).await?;
        if records.len() <= keep {
            return Ok(0);
        }
        let removed = records.len() - keep;
        let kept = &records[removed..];
        rewrite_log(&self.history_path(thread_id), kept).await?;
        debug!(thread_id, removed, keep, "compacted history log");
        Ok(removed)
    }

    /// On-disk statistics for one session. Size comes from a recursive
    /// directory walk, falling back to a content-length estimate when the
    /// walk reports zero.
    pub async fn session_stats(&self, thread_id: &str) -> CairnResult<SessionStats> {
        let checkpoints = self.read_checkpoints(thread_id).await?;
        let history = self.read_history(thread_id).await?;

        let dir = self.session_dir(thread_id);
        let mut size_bytes = dir_size(&dir).await?;
        if size_bytes == 0 {
            size_bytes = content_size(&dir).await;
        }

        Ok(SessionStats {
            checkpoint_count: checkpoints.len(),
            history_count: history.len(),
            last_modified: last_modified(&dir).await,
            size_bytes,
        })
    }

    /// Recursively deletes a session directory. Missing is a no-op; the
    /// manager layer decides whether that is an error.
    pub async fn delete_session(&self, thread_id: &str) -> CairnResult<()> {
        match tokio::fs::remove_dir_all(self.session_dir(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Session ids present under the sessions root, unordered. A missing
    /// root yields an empty list.
    pub async fn list_sessions(&self) -> CairnResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

async fn append_line<T: Serialize>(path: &Path, value: &T) -> CairnResult<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn read_lines<T: DeserializeOwned>(
    path: &Path,
    thread_id: &str,
    log_name: &str,
) -> CairnResult<Vec<T>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for (number, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(thread_id, log_name, line = number + 1, error = %e, "skipping unparsable log line");
            }
        }
    }
    Ok(records)
}

async fn rewrite_log<T: Serialize>(path: &Path, records: &[T]) -> CairnResult<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    tokio::fs::write(path, out).await?;
    Ok(())
}

/// Recursive file-size sum under `dir`; missing dir counts as zero.
async fn dir_size(dir: &Path) -> CairnResult<u64> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Content-length fallback for filesystems that report zero-length files.
async fn content_size(dir: &Path) -> u64 {
    let mut total = 0;
    for name in ["metadata.json", "checkpoints.jsonl", "history.jsonl"] {
        if let Ok(data) = tokio::fs::read_to_string(dir.join(name)).await {
            total += data.len() as u64;
        }
    }
    total
}

async fn last_modified(dir: &Path) -> Option<DateTime<Utc>> {
    let mut latest: Option<DateTime<Utc>> = None;
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if let Ok(modified) = meta.modified() {
                let stamp: DateTime<Utc> = modified.into();
                latest = Some(latest.map_or(stamp, |l| l.max(stamp)));
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{Checkpoint, HistoryEvent};
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> SessionFiles {
        SessionFiles::new(&StorageConfig::with_base_dir(tmp.path()))
    }

    fn checkpoint_record(thread_id: &str, step: u64) -> CheckpointRecord {
        CheckpointRecord::new(
            thread_id,
            Checkpoint {
                id: format!("ckpt-{step}"),
                step,
                channel_values: serde_json::json!({"step": step}),
            },
        )
    }

    #[tokio::test]
    async fn metadata_write_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        let meta = SessionMetadata::new("Round trip");

        files.write_metadata(&meta).await.unwrap();
        let loaded = files.read_metadata(&meta.thread_id).await.unwrap().unwrap();
        assert_eq!(loaded.thread_id, meta.thread_id);
        assert_eq!(loaded.title, "Round trip");
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            meta.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn missing_metadata_is_none_not_error() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        assert!(files.read_metadata("thread-nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_metadata_surfaces_corruption() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        let dir = files.session_dir("thread-torn");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metadata.json"), "").unwrap();

        let err = files.read_metadata("thread-torn").await.unwrap_err();
        assert!(matches!(err, CairnError::Corrupt { .. }));

        std::fs::write(dir.join("metadata.json"), "{not json").unwrap();
        let err = files.read_metadata("thread-torn").await.unwrap_err();
        assert!(matches!(err, CairnError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn append_and_read_logs() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);

        files
            .append_checkpoint(&checkpoint_record("thread-x", 1))
            .await
            .unwrap();
        files
            .append_checkpoint(&checkpoint_record("thread-x", 2))
            .await
            .unwrap();
        let records = files.read_checkpoints("thread-x").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].checkpoint.step, 1);
        assert_eq!(records[1].checkpoint.step, 2);

        assert!(files.read_history("thread-x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_log_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        files
            .append_checkpoint(&checkpoint_record("thread-x", 1))
            .await
            .unwrap();
        // Simulate a torn append in the middle of the log.
        use std::io::Write;
        let path = files.session_dir("thread-x").join("checkpoints.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{torn").unwrap();
        drop(f);
        files
            .append_checkpoint(&checkpoint_record("thread-x", 2))
            .await
            .unwrap();

        let records = files.read_checkpoints("thread-x").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].checkpoint.step, 2);
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        for step in 1..=5 {
            files
                .append_checkpoint(&checkpoint_record("thread-x", step))
                .await
                .unwrap();
        }

        let removed = files.cleanup_old_checkpoints("thread-x", 2).await.unwrap();
        assert_eq!(removed, 3);
        let records = files.read_checkpoints("thread-x").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].checkpoint.step, 4);
        assert_eq!(records[1].checkpoint.step, 5);

        // Already within the limit: no-op.
        let removed = files.cleanup_old_checkpoints("thread-x", 2).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(files.read_checkpoints("thread-x").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_history_to_zero_empties_log() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        for i in 0..5 {
            let record = cairn_core::HistoryRecord::stamp(HistoryEvent::user(format!("m{i}")));
            files.append_history("thread-x", &record).await.unwrap();
        }
        files.cleanup_old_history("thread-x", 0).await.unwrap();
        assert!(files.read_history("thread-x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_and_delete_sessions() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        assert!(files.list_sessions().await.unwrap().is_empty());

        let a = SessionMetadata::new("A");
        let b = SessionMetadata::new("B");
        files.write_metadata(&a).await.unwrap();
        files.write_metadata(&b).await.unwrap();

        let mut ids = files.list_sessions().await.unwrap();
        ids.sort();
        let mut expected = vec![a.thread_id.clone(), b.thread_id.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        files.delete_session(&a.thread_id).await.unwrap();
        assert_eq!(files.list_sessions().await.unwrap().len(), 1);
        assert!(!files.exists(&a.thread_id).await);
        // Deleting again is a file-level no-op.
        files.delete_session(&a.thread_id).await.unwrap();
    }

    #[tokio::test]
    async fn stats_count_records_and_size() {
        let tmp = TempDir::new().unwrap();
        let files = store(&tmp);
        let meta = SessionMetadata::new("Stats");
        files.write_metadata(&meta).await.unwrap();
        files
            .append_checkpoint(&checkpoint_record(&meta.thread_id, 1))
            .await
            .unwrap();
        let record = cairn_core::HistoryRecord::stamp(HistoryEvent::user("hi"));
        files.append_history(&meta.thread_id, &record).await.unwrap();

        let stats = files.session_stats(&meta.thread_id).await.unwrap();
        assert_eq!(stats.checkpoint_count, 1);
        assert_eq!(stats.history_count, 1);
        assert!(stats.size_bytes > 0);
        assert!(stats.last_modified.is_some());
    }
}
