use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use cairn_core::{CairnError, CairnResult, SessionStatus};

use crate::config::StorageConfig;
use crate::history::HistoryQueries;
use crate::lock::{LockStatus, SessionLocks};
use crate::locked::LockedSessionManager;
use crate::manager::{SessionFilter, SessionManager, SessionOps};

/// Storage-footprint heuristics for estimates that must not require
/// touching every file: rough serialized size per record kind.
const HISTORY_RECORD_BYTES: u64 = 512;
const CHECKPOINT_RECORD_BYTES: u64 = 2048;
const SESSION_BASE_BYTES: u64 = 1024;

/// Soft limits that turn into health recommendations when exceeded.
const LARGE_SESSION_BYTES: u64 = 10 * 1024 * 1024;
const LARGE_TOTAL_BYTES: u64 = 100 * 1024 * 1024;
const DEEP_LOCK_QUEUE: usize = 5;
/// More recommendations than this downgrade overall health to warning.
const WARNING_THRESHOLD: usize = 2;

/// Export output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array.
    Json,
    /// Comma-separated values with a header row.
    Csv,
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issues, few or no recommendations.
    Healthy,
    /// No issues, but enough recommendations to warrant attention.
    Warning,
    /// At least one structural issue.
    Error,
}

/// Result of a [`SessionStorage::health_check`] scan. Structural problems
/// become entries here rather than errors, so an operator can inspect a
/// damaged store without crashing it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall classification.
    pub status: HealthStatus,
    /// Structural problems that need intervention.
    pub issues: Vec<String>,
    /// Soft problems worth attention.
    pub recommendations: Vec<String>,
    /// Sessions examined.
    pub checked_sessions: usize,
}

/// Aggregate statistics across all sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Total sessions on disk.
    pub sessions_total: usize,
    /// Sessions with active status.
    pub sessions_active: usize,
    /// Sessions with archived status.
    pub sessions_archived: usize,
    /// Sessions with completed status.
    pub sessions_completed: usize,
    /// Checkpoint records across all sessions.
    pub checkpoints_total: usize,
    /// History records across all sessions.
    pub history_total: usize,
    /// Estimated footprint from per-record heuristics, not exact bytes.
    pub estimated_storage_bytes: u64,
    /// Mean session age in milliseconds.
    pub average_session_age_ms: i64,
}

/// Options for [`SessionStorage::cleanup`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Hard-delete archived sessions.
    pub delete_archived: bool,
    /// Compact history/checkpoint logs exceeding the configured maxima.
    pub compact_logs: bool,
    /// Archive active sessions not updated within this many days.
    pub archive_older_than_days: Option<i64>,
}

/// Aggregate result of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Sessions deleted, compacted, or archived.
    pub sessions_cleaned: usize,
    /// Records removed by deletion and compaction.
    pub records_deleted: usize,
    /// Estimated bytes freed.
    pub bytes_freed: u64,
}

#[derive(Serialize)]
struct ExportRow {
    thread_id: String,
    title: String,
    status: SessionStatus,
    created_at: i64,
    updated_at: i64,
    message_count: u64,
    checkpoint_count: usize,
    history_count: usize,
    size_bytes: u64,
}

/// Single entry point for session storage: lifecycle, statistics, health
/// diagnostics, retention cleanup, and export.
///
/// Owns the lock table explicitly (no process-wide singleton) so isolated
/// instances — one per test, one per embedded store — cannot interfere.
pub struct SessionStorage {
    config: StorageConfig,
    locks: SessionLocks,
    sessions: Arc<LockedSessionManager>,
    history: HistoryQueries,
}

impl SessionStorage {
    /// Builds a storage facade over the given configuration. Directories
    /// are not touched until [`SessionStorage::initialize`] or the first
    /// write.
    pub fn open(config: StorageConfig) -> Self {
        let locks = SessionLocks::new();
        let sessions = Arc::new(LockedSessionManager::new(
            SessionManager::new(config.clone()),
            locks.clone(),
        ));
        let history = HistoryQueries::new(sessions.clone());
        Self {
            config,
            locks,
            sessions,
            history,
        }
    }

    /// Ensures the directory structure exists. Idempotent.
    pub async fn initialize(&self) -> CairnResult<()> {
        self.sessions.inner().files().ensure_root().await?;
        info!(base_dir = %self.config.base_dir.display(), "session storage initialized");
        Ok(())
    }

    /// Tears down: force-releases all locks as a safety net against
    /// guards leaked by crashed tasks. Idempotent.
    pub fn close(&self) {
        self.locks.force_release_all();
        info!("session storage closed");
    }

    /// The lock-decorated session manager.
    pub fn sessions(&self) -> &Arc<LockedSessionManager> {
        &self.sessions
    }

    /// Derived history queries and analytics.
    pub fn history(&self) -> &HistoryQueries {
        &self.history
    }

    /// The active configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Lock-table diagnostics.
    pub fn lock_status(&self) -> LockStatus {
        self.locks.status()
    }

    /// Totals across all sessions. Storage is estimated from per-record
    /// heuristics rather than exact byte counts.
    pub async fn system_stats(&self) -> CairnResult<SystemStats> {
        let infos = self.sessions.list_sessions(SessionFilter::default()).await?;
        let now = Utc::now();

        let mut stats = SystemStats {
            sessions_total: infos.len(),
            sessions_active: 0,
            sessions_archived: 0,
            sessions_completed: 0,
            checkpoints_total: 0,
            history_total: 0,
            estimated_storage_bytes: 0,
            average_session_age_ms: 0,
        };
        let mut age_sum_ms: i64 = 0;
        for info in &infos {
            match info.metadata.status {
                SessionStatus::Active => stats.sessions_active += 1,
                SessionStatus::Archived => stats.sessions_archived += 1,
                SessionStatus::Completed => stats.sessions_completed += 1,
            }
            stats.checkpoints_total += info.checkpoint_count;
            stats.history_total += info.history_count;
            stats.estimated_storage_bytes += SESSION_BASE_BYTES
                + info.history_count as u64 * HISTORY_RECORD_BYTES
                + info.checkpoint_count as u64 * CHECKPOINT_RECORD_BYTES;
            age_sum_ms += (now - info.metadata.created_at).num_milliseconds();
        }
        if !infos.is_empty() {
            stats.average_session_age_ms = age_sum_ms / infos.len() as i64;
        }
        Ok(stats)
    }

    /// Scans every session for structural problems (issues) and soft
    /// problems (recommendations). Never fails on a damaged session; the
    /// damage becomes part of the report.
    pub async fn health_check(&self) -> CairnResult<HealthReport> {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();
        let mut total_bytes: u64 = 0;

        let thread_ids = self.sessions.inner().thread_ids().await?;
        let checked_sessions = thread_ids.len();
        for thread_id in thread_ids {
            let info = match self.sessions.session_info(&thread_id).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    issues.push(format!("session {thread_id}: metadata.json is missing"));
                    continue;
                }
                Err(CairnError::Corrupt { detail, .. }) => {
                    issues.push(format!("session {thread_id}: corrupt metadata ({detail})"));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if info.metadata.message_count > 0 && info.history_count == 0 {
                issues.push(format!(
                    "session {thread_id}: message_count is {} but the history log is empty",
                    info.metadata.message_count
                ));
            }
            if info.size_bytes > LARGE_SESSION_BYTES {
                recommendations.push(format!(
                    "session {thread_id}: {} bytes on disk, consider cleanup",
                    info.size_bytes
                ));
            }
            if info.checkpoint_count > self.config.max_checkpoints {
                recommendations.push(format!(
                    "session {thread_id}: {} checkpoints exceed the configured maximum {}",
                    info.checkpoint_count, self.config.max_checkpoints
                ));
            }
            if info.history_count > self.config.max_history_records {
                recommendations.push(format!(
                    "session {thread_id}: {} history records exceed the configured maximum {}",
                    info.history_count, self.config.max_history_records
                ));
            }
            total_bytes += info.size_bytes;
        }

        if total_bytes > LARGE_TOTAL_BYTES {
            recommendations.push(format!(
                "total storage is {total_bytes} bytes, consider retention cleanup"
            ));
        }
        let lock_status = self.locks.status();
        if lock_status.total_waiters() > DEEP_LOCK_QUEUE {
            recommendations.push(format!(
                "{} operations are queued on session locks",
                lock_status.total_waiters()
            ));
        }

        let status = if !issues.is_empty() {
            HealthStatus::Error
        } else if recommendations.len() > WARNING_THRESHOLD {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        if status != HealthStatus::Healthy {
            warn!(?status, issues = issues.len(), "health check found problems");
        }
        Ok(HealthReport {
            status,
            issues,
            recommendations,
            checked_sessions,
        })
    }

    /// Retention pass over every session: optionally hard-deletes archived
    /// sessions, compacts oversized logs, and archives sessions idle past
    /// the cutoff.
    pub async fn cleanup(&self, options: CleanupOptions) -> CairnResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let archive_cutoff = options
            .archive_older_than_days
            .map(|days| Utc::now() - Duration::days(days));

        for info in self.sessions.list_sessions(SessionFilter::default()).await? {
            let thread_id = info.metadata.thread_id.clone();

            if options.delete_archived && info.metadata.status == SessionStatus::Archived {
                self.sessions.delete_session(&thread_id).await?;
                report.sessions_cleaned += 1;
                report.records_deleted += info.history_count + info.checkpoint_count;
                report.bytes_freed += info.size_bytes;
                continue;
            }

            let mut touched = false;
            if options.compact_logs {
                // Compaction is a raw file rewrite, so take the session's
                // lock ourselves before going through the file layer.
                let _guard = self.locks.acquire(&thread_id).await;
                let files = self.sessions.inner().files();
                let removed_history = files
                    .cleanup_old_history(&thread_id, self.config.max_history_records)
                    .await?;
                let removed_checkpoints = files
                    .cleanup_old_checkpoints(&thread_id, self.config.max_checkpoints)
                    .await?;
                if removed_history + removed_checkpoints > 0 {
                    report.records_deleted += removed_history + removed_checkpoints;
                    report.bytes_freed += removed_history as u64 * HISTORY_RECORD_BYTES
                        + removed_checkpoints as u64 * CHECKPOINT_RECORD_BYTES;
                    touched = true;
                }
            }

            if let Some(cutoff) = archive_cutoff {
                if info.metadata.status == SessionStatus::Active
                    && info.metadata.updated_at < cutoff
                {
                    self.sessions.archive_session(&thread_id).await?;
                    touched = true;
                }
            }
            if touched {
                report.sessions_cleaned += 1;
            }
        }

        info!(
            sessions = report.sessions_cleaned,
            records = report.records_deleted,
            "cleanup pass finished"
        );
        Ok(report)
    }

    /// Serializes all session metadata plus derived counts for offline
    /// analysis or backup.
    pub async fn export_all(&self, format: ExportFormat) -> CairnResult<String> {
        let infos = self.sessions.list_sessions(SessionFilter::default()).await?;
        let rows: Vec<ExportRow> = infos
            .into_iter()
            .map(|info| ExportRow {
                thread_id: info.metadata.thread_id,
                title: info.metadata.title,
                status: info.metadata.status,
                created_at: info.metadata.created_at.timestamp_millis(),
                updated_at: info.metadata.updated_at.timestamp_millis(),
                message_count: info.metadata.message_count,
                checkpoint_count: info.checkpoint_count,
                history_count: info.history_count,
                size_bytes: info.size_bytes,
            })
            .collect();

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&rows)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "thread_id,title,status,created_at,updated_at,message_count,checkpoint_count,history_count,size_bytes\n",
                );
                for row in rows {
                    let status = match row.status {
                        SessionStatus::Active => "active",
                        SessionStatus::Archived => "archived",
                        SessionStatus::Completed => "completed",
                    };
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{}\n",
                        csv_escape(&row.thread_id),
                        csv_escape(&row.title),
                        status,
                        row.created_at,
                        row.updated_at,
                        row.message_count,
                        row.checkpoint_count,
                        row.history_count,
                        row.size_bytes
                    ));
                }
                Ok(out)
            }
        }
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{HistoryEvent, SessionUpdate};
    use crate::manager::UpdateOptions;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> SessionStorage {
        SessionStorage::open(StorageConfig::with_base_dir(tmp.path()))
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        storage.initialize().await.unwrap();
        storage.initialize().await.unwrap();
        assert!(tmp.path().join("sessions").is_dir());
        storage.close();
        storage.close();
    }

    #[tokio::test]
    async fn system_stats_aggregate_counts() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();

        let a = sessions
            .create_session(Some("A".into()), None, Some("hello".into()))
            .await
            .unwrap();
        sessions
            .save_checkpoint(&a.thread_id, serde_json::json!({}), None)
            .await
            .unwrap();
        let b = sessions.create_session(Some("B".into()), None, None).await.unwrap();
        sessions.archive_session(&b.thread_id).await.unwrap();

        let stats = storage.system_stats().await.unwrap();
        assert_eq!(stats.sessions_total, 2);
        assert_eq!(stats.sessions_active, 1);
        assert_eq!(stats.sessions_archived, 1);
        assert_eq!(stats.checkpoints_total, 1);
        assert_eq!(stats.history_total, 1);
        assert!(stats.estimated_storage_bytes >= 2 * SESSION_BASE_BYTES);
        assert!(stats.average_session_age_ms >= 0);
    }

    #[tokio::test]
    async fn health_check_reports_count_mismatch_one_issue() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();
        let meta = sessions.create_session(None, None, None).await.unwrap();

        // Claim three messages while the history log stays empty.
        sessions
            .update_metadata(
                &meta.thread_id,
                SessionUpdate {
                    message_count: Some(3),
                    ..SessionUpdate::default()
                },
                UpdateOptions::default(),
            )
            .await
            .unwrap();

        let report = storage.health_check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains(&meta.thread_id));
        assert_eq!(report.checked_sessions, 1);
    }

    #[tokio::test]
    async fn health_check_flags_corrupt_and_missing_metadata() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();
        let good = sessions.create_session(None, None, None).await.unwrap();

        let sessions_dir = tmp.path().join("sessions");
        std::fs::create_dir_all(sessions_dir.join("thread-empty")).unwrap();
        let corrupt_dir = sessions_dir.join("thread-corrupt");
        std::fs::create_dir_all(&corrupt_dir).unwrap();
        std::fs::write(corrupt_dir.join("metadata.json"), "{oops").unwrap();

        let report = storage.health_check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Error);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().any(|i| i.contains("thread-empty")));
        assert!(report.issues.iter().any(|i| i.contains("thread-corrupt")));
        assert!(!report.issues.iter().any(|i| i.contains(&good.thread_id)));
    }

    #[tokio::test]
    async fn aggregates_skip_corrupt_sessions() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();
        let good = sessions
            .create_session(Some("good".into()), None, Some("hi".into()))
            .await
            .unwrap();

        let torn_dir = tmp.path().join("sessions").join("thread-torn");
        std::fs::create_dir_all(&torn_dir).unwrap();
        std::fs::write(torn_dir.join("metadata.json"), "{torn").unwrap();

        // Listings, stats, and export must survive the damage; only the
        // intact session shows up.
        let infos = sessions.list_sessions(SessionFilter::default()).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].metadata.thread_id, good.thread_id);

        let stats = storage.system_stats().await.unwrap();
        assert_eq!(stats.sessions_total, 1);

        let json = storage.export_all(ExportFormat::Json).await.unwrap();
        let rows: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);

        // Direct single-session reads still fail loudly.
        let err = sessions.get_session("thread-torn").await.unwrap_err();
        assert!(matches!(err, CairnError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn healthy_store_reports_healthy() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        storage
            .sessions()
            .create_session(None, None, Some("hi".into()))
            .await
            .unwrap();
        let report = storage.health_check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn cleanup_deletes_archived_and_archives_stale() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();

        let keep = sessions.create_session(Some("keep".into()), None, None).await.unwrap();
        let gone = sessions.create_session(Some("gone".into()), None, Some("x".into())).await.unwrap();
        sessions.archive_session(&gone.thread_id).await.unwrap();

        let report = storage
            .cleanup(CleanupOptions {
                delete_archived: true,
                ..CleanupOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.sessions_cleaned, 1);
        assert!(report.records_deleted >= 1);
        assert!(report.bytes_freed > 0);
        assert!(sessions.get_session(&gone.thread_id).await.unwrap().is_none());

        // Zero-day cutoff archives everything idle "since now".
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let report = storage
            .cleanup(CleanupOptions {
                archive_older_than_days: Some(0),
                ..CleanupOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.sessions_cleaned, 1);
        let reloaded = sessions.get_session(&keep.thread_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Archived);
    }

    #[tokio::test]
    async fn cleanup_compacts_oversized_logs() {
        let tmp = TempDir::new().unwrap();
        let mut config = StorageConfig::with_base_dir(tmp.path());
        config.max_history_records = 2;
        let storage = SessionStorage::open(config);
        let sessions = storage.sessions().clone();
        let meta = sessions.create_session(None, None, None).await.unwrap();

        // Bypass the manager's per-append compaction to build an oversized log.
        let files = sessions.inner().files().clone();
        for i in 0..5 {
            let record = cairn_core::HistoryRecord::stamp(HistoryEvent::user(format!("m{i}")));
            files.append_history(&meta.thread_id, &record).await.unwrap();
        }

        let report = storage
            .cleanup(CleanupOptions {
                compact_logs: true,
                ..CleanupOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.sessions_cleaned, 1);
        assert_eq!(report.records_deleted, 3);
        assert_eq!(files.read_history(&meta.thread_id).await.unwrap().len(), 2);

        // Already within limits: cleanup is a no-op.
        let report = storage
            .cleanup(CleanupOptions {
                compact_logs: true,
                ..CleanupOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.sessions_cleaned, 0);
    }

    #[tokio::test]
    async fn export_json_and_csv() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        let sessions = storage.sessions().clone();
        sessions
            .create_session(Some("Demo, with comma".into()), None, Some("hi".into()))
            .await
            .unwrap();

        let json = storage.export_all(ExportFormat::Json).await.unwrap();
        let rows: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["status"], "active");
        assert_eq!(rows[0]["history_count"], 1);

        let csv = storage.export_all(ExportFormat::Csv).await.unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("thread_id,title,status"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Demo, with comma\""));
        assert!(row.contains(",active,"));
    }
}
