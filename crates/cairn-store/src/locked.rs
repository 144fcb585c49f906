use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use cairn_core::{
    CairnError, CairnResult, CheckpointRecord, HistoryEvent, HistoryRecord, SessionMetadata,
    SessionUpdate,
};

use crate::lock::{LockStatus, SessionLocks};
use crate::manager::{
    apply_session_filter, HistoryFilter, SessionFilter, SessionInfo, SessionManager, SessionOps,
    UpdateOptions,
};

/// Shared key serializing concurrent creations, so two callers cannot
/// race on identifier generation.
const CREATE_KEY: &str = "session:create";

/// [`SessionManager`] with every operation made atomic against concurrent
/// callers on the same session.
///
/// Each method acquires the session's lock (keyed by thread id) before
/// delegating and releases it on every path, success or failure. The
/// guarantee only holds when all access goes through this type; direct
/// [`crate::SessionFiles`] use bypasses it.
pub struct LockedSessionManager {
    inner: SessionManager,
    locks: SessionLocks,
}

impl LockedSessionManager {
    /// Wraps a manager with the given lock table. The table is shared
    /// with the facade so diagnostics see the same queues.
    pub fn new(inner: SessionManager, locks: SessionLocks) -> Self {
        Self { inner, locks }
    }

    /// The undecorated manager. Operations invoked through it are not
    /// serialized; intended for read-only diagnostics.
    pub fn inner(&self) -> &SessionManager {
        &self.inner
    }

    /// Clears every held lock and wakes every waiter. Unsafe last resort
    /// for shutdown and crash recovery; see [`SessionLocks::force_release_all`].
    pub fn force_release_all_locks(&self) {
        self.locks.force_release_all();
    }

    /// Lock-table diagnostics.
    pub fn lock_status(&self) -> LockStatus {
        self.locks.status()
    }
}

#[async_trait]
impl SessionOps for LockedSessionManager {
    async fn create_session(
        &self,
        title: Option<String>,
        language: Option<String>,
        initial_message: Option<String>,
    ) -> CairnResult<SessionMetadata> {
        let _guard = self.locks.acquire(CREATE_KEY).await;
        self.inner.create_session(title, language, initial_message).await
    }

    async fn get_session(&self, thread_id: &str) -> CairnResult<Option<SessionMetadata>> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.get_session(thread_id).await
    }

    async fn update_metadata(
        &self,
        thread_id: &str,
        update: SessionUpdate,
        opts: UpdateOptions,
    ) -> CairnResult<SessionMetadata> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.update_metadata(thread_id, update, opts).await
    }

    async fn save_checkpoint(
        &self,
        thread_id: &str,
        channel_values: serde_json::Value,
        checkpoint_id: Option<String>,
    ) -> CairnResult<CheckpointRecord> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner
            .save_checkpoint(thread_id, channel_values, checkpoint_id)
            .await
    }

    async fn latest_checkpoint(&self, thread_id: &str) -> CairnResult<Option<CheckpointRecord>> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.latest_checkpoint(thread_id).await
    }

    async fn checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> CairnResult<Option<CheckpointRecord>> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.checkpoint(thread_id, checkpoint_id).await
    }

    async fn add_history_record(
        &self,
        thread_id: &str,
        event: HistoryEvent,
    ) -> CairnResult<HistoryRecord> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.add_history_record(thread_id, event).await
    }

    async fn history(
        &self,
        thread_id: &str,
        filter: HistoryFilter,
    ) -> CairnResult<Vec<HistoryRecord>> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.history(thread_id, filter).await
    }

    async fn prune_history(
        &self,
        thread_id: &str,
        cutoff: DateTime<Utc>,
        preserve_high_priority: bool,
    ) -> CairnResult<usize> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner
            .prune_history(thread_id, cutoff, preserve_high_priority)
            .await
    }

    async fn session_info(&self, thread_id: &str) -> CairnResult<Option<SessionInfo>> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.session_info(thread_id).await
    }

    /// The enumeration itself runs unlocked (it spans many sessions), but
    /// each session's info is loaded under that session's own lock so a
    /// listing never tears against an in-flight write.
    async fn list_sessions(&self, filter: SessionFilter) -> CairnResult<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        for thread_id in self.inner.thread_ids().await? {
            let _guard = self.locks.acquire(&thread_id).await;
            match self.inner.session_info(&thread_id).await {
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
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.archive_session(thread_id).await
    }

    async fn restore_session(&self, thread_id: &str) -> CairnResult<()> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.restore_session(thread_id).await
    }

    async fn complete_session(&self, thread_id: &str) -> CairnResult<()> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.complete_session(thread_id).await
    }

    async fn delete_session(&self, thread_id: &str) -> CairnResult<()> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.delete_session(thread_id).await
    }

    async fn generate_title(&self, thread_id: &str) -> CairnResult<String> {
        let _guard = self.locks.acquire(thread_id).await;
        self.inner.generate_title(thread_id).await
    }
}
