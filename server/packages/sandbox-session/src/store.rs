//! Session State Store - the process-wide registry of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use sandbox_session_error::SessionError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, Notify, RwLock};
use utoipa::ToSchema;

use crate::provider::{SandboxHandle, SandboxId};

/// Session status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// One result produced by the request handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ResultEntry {
    pub message: String,
}

impl ResultEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Always equal to the id of the sandbox backing the session.
    pub session_id: SandboxId,
    pub status: SessionStatus,
    pub results: Vec<ResultEntry>,
    pub image: String,
    pub created_at: String,
}

impl SessionRecord {
    pub fn new(session_id: SandboxId, image: impl Into<String>) -> Self {
        Self {
            session_id,
            status: SessionStatus::Running,
            results: Vec::new(),
            image: image.into(),
            created_at: String::new(),
        }
    }

    /// Builds the record for a freshly provisioned sandbox. The session id is
    /// taken from the handle so the two can never disagree.
    pub fn for_sandbox(handle: &SandboxHandle) -> Self {
        let mut record = Self::new(handle.id().clone(), handle.image().as_str());
        record.created_at = handle.created_at().format(&Rfc3339).unwrap_or_default();
        record
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} is already registered")]
    DuplicateKey(SandboxId),
    #[error("session {0} is not registered")]
    NotFound(SandboxId),
}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateKey(id) => SessionError::DuplicateSession {
                session_id: id.to_string(),
            },
            StoreError::NotFound(id) => SessionError::SessionNotFound {
                session_id: id.to_string(),
            },
        }
    }
}

/// Registry of live sessions keyed by sandbox id.
///
/// Each record sits behind its own lock. `remove` flips the record to
/// `Stopped` under that lock before letting go of it, so an `append_result`
/// racing a removal either lands first or fails with `NotFound`; it is never
/// written to a record nobody can see.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SandboxId, Arc<Mutex<SessionRecord>>>>,
    removed: Notify,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&record.session_id) {
            return Err(StoreError::DuplicateKey(record.session_id));
        }
        sessions.insert(record.session_id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub async fn get(&self, id: &SandboxId) -> Result<SessionRecord, StoreError> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// Appends one result and returns the record as it stands right after.
    pub async fn append_result(
        &self,
        id: &SandboxId,
        entry: ResultEntry,
    ) -> Result<SessionRecord, StoreError> {
        let record = self.entry(id).await?;
        let mut record = record.lock().await;
        if record.status != SessionStatus::Running {
            return Err(StoreError::NotFound(id.clone()));
        }
        record.results.push(entry);
        Ok(record.clone())
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &SandboxId) -> Option<SessionRecord> {
        let entry = self.sessions.write().await.remove(id)?;
        let snapshot = {
            let mut record = entry.lock().await;
            record.status = SessionStatus::Stopped;
            record.clone()
        };
        self.removed.notify_waiters();
        Some(snapshot)
    }

    pub async fn list(&self) -> Vec<SessionRecord> {
        let entries: Vec<Arc<Mutex<SessionRecord>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: &SandboxId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Resolves once no session is registered.
    pub async fn wait_empty(&self) {
        loop {
            let removed = self.removed.notified();
            if self.is_empty().await {
                return;
            }
            removed.await;
        }
    }

    async fn entry(&self, id: &SandboxId) -> Result<Arc<Mutex<SessionRecord>>, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(SandboxId::new(id), "alpine:3")
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = SessionStore::new();
        store.insert(record("a")).await.expect("insert");
        let err = store.insert(record("a")).await.expect_err("duplicate");
        assert_eq!(err, StoreError::DuplicateKey(SandboxId::new("a")));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn get_and_append_fail_for_unknown_ids() {
        let store = SessionStore::new();
        let id = SandboxId::new("ghost");
        assert_eq!(store.get(&id).await.expect_err("get"), StoreError::NotFound(id.clone()));
        assert_eq!(
            store
                .append_result(&id, ResultEntry::new("x"))
                .await
                .expect_err("append"),
            StoreError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn append_returns_snapshot_in_order() {
        let store = SessionStore::new();
        let id = SandboxId::new("a");
        store.insert(record("a")).await.expect("insert");

        let first = store
            .append_result(&id, ResultEntry::new("one"))
            .await
            .expect("append");
        assert_eq!(first.results.len(), 1);
        let second = store
            .append_result(&id, ResultEntry::new("two"))
            .await
            .expect("append");
        assert_eq!(
            second.results,
            vec![ResultEntry::new("one"), ResultEntry::new("two")]
        );
        assert_eq!(second.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_blocks_later_appends() {
        let store = SessionStore::new();
        let id = SandboxId::new("a");
        store.insert(record("a")).await.expect("insert");

        let removed = store.remove(&id).await.expect("removed");
        assert_eq!(removed.status, SessionStatus::Stopped);
        assert!(store.remove(&id).await.is_none());
        assert!(store
            .append_result(&id, ResultEntry::new("late"))
            .await
            .is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_racing_remove_are_either_kept_or_refused() {
        let store = Arc::new(SessionStore::new());
        let id = SandboxId::new("a");
        store.insert(record("a")).await.expect("insert");

        let mut appenders = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            let id = id.clone();
            appenders.push(tokio::spawn(async move {
                let mut acknowledged = 0usize;
                for n in 0.. {
                    let entry = ResultEntry::new(format!("{worker}-{n}"));
                    match store.append_result(&id, entry).await {
                        Ok(_) => acknowledged += 1,
                        Err(err) => {
                            assert_eq!(err, StoreError::NotFound(id.clone()));
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                acknowledged
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = store.remove(&id).await.expect("removed");

        let mut acknowledged = 0;
        for appender in appenders {
            acknowledged += appender.await.expect("join");
        }
        // Every acknowledged append is in the final record; none after it.
        assert_eq!(removed.results.len(), acknowledged);
        assert_eq!(removed.status, SessionStatus::Stopped);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sessions_do_not_share_results() {
        let store = Arc::new(SessionStore::new());
        store.insert(record("a")).await.expect("insert a");
        store.insert(record("b")).await.expect("insert b");

        let mut tasks = Vec::new();
        for (id, count) in [("a", 50usize), ("b", 30usize)] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let id = SandboxId::new(id);
                for n in 0..count {
                    store
                        .append_result(&id, ResultEntry::new(format!("{id}-{n}")))
                        .await
                        .expect("append");
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let a = store.get(&SandboxId::new("a")).await.expect("a");
        let b = store.get(&SandboxId::new("b")).await.expect("b");
        assert_eq!(a.results.len(), 50);
        assert_eq!(b.results.len(), 30);
        assert!(a.results.iter().all(|entry| entry.message.starts_with("a-")));
        assert!(b.results.iter().all(|entry| entry.message.starts_with("b-")));
        assert_eq!(a.results[49].message, "a-49");
    }

    #[tokio::test]
    async fn wait_empty_resolves_after_last_removal() {
        let store = Arc::new(SessionStore::new());
        store.insert(record("a")).await.expect("insert");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.remove(&SandboxId::new("a")).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
    }
}
