use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (max_size={capacity})")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Training,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPayload {
    pub job_id: Uuid,
    pub task_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub kind: EntryKind,
    pub payload: EntryPayload,
    pub status: EntryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Entries that are queued or running.
    pub queue_length: usize,
    pub queued: usize,
    pub running: usize,
    /// Lifetime counters, unaffected by history eviction.
    pub completed: u64,
    pub failed: u64,
    pub retained: usize,
    pub capacity: usize,
    pub current_job: Option<QueueEntry>,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
    current: Option<u64>,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    fn active_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    fn current_entry(&self) -> Option<QueueEntry> {
        let id = self.current?;
        self.entries.iter().find(|e| e.id == id).cloned()
    }

    /// Drops the oldest terminal entries once more than `limit` are retained.
    fn evict_history(&mut self, limit: usize) {
        let mut terminal = self
            .entries
            .iter()
            .filter(|e| e.status.is_terminal())
            .count();
        while terminal > limit {
            let Some(pos) = self.entries.iter().position(|e| e.status.is_terminal()) else {
                break;
            };
            self.entries.remove(pos);
            terminal -= 1;
        }
    }
}

/// Bounded in-process FIFO between trigger callers and the single training worker.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    history_limit: usize,
    wake_interval: Duration,
}

impl WorkQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                next_id: 1,
                current: None,
                completed_total: 0,
                failed_total: 0,
            }),
            notify: Notify::new(),
            capacity: config.capacity,
            history_limit: config.history_limit,
            wake_interval: config.wake_interval,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // state stays consistent across every critical section, so a poisoned lock is usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_job(&self, kind: EntryKind, payload: EntryPayload) -> Result<u64, QueueError> {
        let id = {
            let mut state = self.lock();
            if state.active_len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            tracing::info!(queue_id = id, job_id = %payload.job_id, "queue: added training entry");
            state.entries.push_back(QueueEntry {
                id,
                kind,
                payload,
                status: EntryStatus::Queued,
                error: None,
                created_at: Utc::now(),
                completed_at: None,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    fn take_next(&self) -> Option<QueueEntry> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.status == EntryStatus::Queued)?;
        entry.status = EntryStatus::Running;
        let snapshot = entry.clone();
        state.current = Some(snapshot.id);
        tracing::info!(
            queue_id = snapshot.id,
            job_id = %snapshot.payload.job_id,
            "queue: starting entry"
        );
        Some(snapshot)
    }

    /// Waits for the earliest queued entry and marks it running.
    ///
    /// Returns `None` once `shutdown` is cancelled. Only one consumer is supported.
    pub async fn get_next_job(&self, shutdown: &CancellationToken) -> Option<QueueEntry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(entry) = self.take_next() {
                return Some(entry);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.wake_interval) => {}
            }
        }
    }

    /// Moves a non-terminal entry to completed/failed. Returns false for unknown or
    /// already finished entries.
    pub fn complete_job(&self, id: u64, success: bool, error: Option<String>) -> bool {
        let transitioned = {
            let mut state = self.lock();
            let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) else {
                tracing::warn!(queue_id = id, "queue: completion for unknown entry");
                return false;
            };
            if entry.status.is_terminal() {
                tracing::warn!(queue_id = id, status = ?entry.status, "queue: entry already finished");
                return false;
            }
            entry.status = if success {
                EntryStatus::Completed
            } else {
                EntryStatus::Failed
            };
            entry.error = error;
            entry.completed_at = Some(Utc::now());

            if success {
                state.completed_total += 1;
            } else {
                state.failed_total += 1;
            }
            if state.current == Some(id) {
                state.current = None;
            }
            state.evict_history(self.history_limit);
            tracing::info!(queue_id = id, success, "queue: entry finished");
            true
        };
        self.notify.notify_waiters();
        transitioned
    }

    pub fn get_current_job(&self) -> Option<QueueEntry> {
        self.lock().current_entry()
    }

    pub fn get_entry(&self, id: u64) -> Option<QueueEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            queue_length: state.active_len(),
            queued: state.count(EntryStatus::Queued),
            running: state.count(EntryStatus::Running),
            completed: state.completed_total,
            failed: state.failed_total,
            retained: state.entries.len(),
            capacity: self.capacity,
            current_job: state.current_entry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(capacity: usize, history_limit: usize) -> WorkQueue {
        WorkQueue::new(&QueueConfig {
            capacity,
            history_limit,
            wake_interval: Duration::from_millis(20),
        })
    }

    fn payload() -> EntryPayload {
        EntryPayload {
            job_id: Uuid::new_v4(),
            task_type: "aircraft".into(),
        }
    }

    #[test]
    fn rejects_entries_beyond_capacity() {
        let q = queue(3, 10);
        for n in 1..=3 {
            q.add_job(EntryKind::Training, payload()).unwrap();
            assert_eq!(q.get_queue_status().queue_length, n);
        }
        let err = q.add_job(EntryKind::Training, payload()).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 3 });
        assert_eq!(err.to_string(), "Queue is full (max_size=3)");
    }

    #[tokio::test]
    async fn finished_entries_free_capacity() {
        let q = queue(1, 10);
        let shutdown = CancellationToken::new();
        let id = q.add_job(EntryKind::Training, payload()).unwrap();
        assert!(q.add_job(EntryKind::Training, payload()).is_err());

        let entry = q.get_next_job(&shutdown).await.unwrap();
        assert_eq!(entry.id, id);
        assert!(q.complete_job(id, true, None));
        assert!(q.add_job(EntryKind::Training, payload()).is_ok());
    }

    #[tokio::test]
    async fn next_job_is_fifo_and_never_repeats() {
        let q = queue(5, 10);
        let shutdown = CancellationToken::new();
        let first = q.add_job(EntryKind::Training, payload()).unwrap();
        let second = q.add_job(EntryKind::Training, payload()).unwrap();

        let a = q.get_next_job(&shutdown).await.unwrap();
        assert_eq!(a.id, first);
        assert_eq!(a.status, EntryStatus::Running);
        assert_eq!(q.get_current_job().unwrap().id, first);

        let b = q.get_next_job(&shutdown).await.unwrap();
        assert_eq!(b.id, second);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn blocked_consumer_wakes_on_add() {
        let q = Arc::new(queue(5, 10));
        let shutdown = CancellationToken::new();

        let consumer = {
            let q = q.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { q.get_next_job(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = q.add_job(EntryKind::Training, payload()).unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, id);
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_consumer() {
        let q = queue(5, 10);
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let next = tokio::time::timeout(Duration::from_secs(2), q.get_next_job(&shutdown))
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn completion_updates_counters_and_current() {
        let q = queue(5, 10);
        let shutdown = CancellationToken::new();
        let ok_id = q.add_job(EntryKind::Training, payload()).unwrap();
        let bad_id = q.add_job(EntryKind::Training, payload()).unwrap();

        q.get_next_job(&shutdown).await.unwrap();
        assert!(q.complete_job(ok_id, true, None));
        let status = q.get_queue_status();
        assert_eq!(status.completed, 1);
        assert!(status.current_job.is_none());

        q.get_next_job(&shutdown).await.unwrap();
        assert!(q.complete_job(bad_id, false, Some("x".into())));
        let status = q.get_queue_status();
        assert_eq!(status.failed, 1);
        assert_eq!(q.get_entry(bad_id).unwrap().error.as_deref(), Some("x"));

        // no backward transitions
        assert!(!q.complete_job(bad_id, true, None));
        assert_eq!(q.get_queue_status().completed, 1);
    }

    #[test]
    fn completing_a_non_current_entry_keeps_current() {
        let q = queue(5, 10);
        let running = q.add_job(EntryKind::Training, payload()).unwrap();
        let waiting = q.add_job(EntryKind::Training, payload()).unwrap();
        q.take_next().unwrap();

        assert!(q.complete_job(waiting, false, Some("dropped".into())));
        assert_eq!(q.get_current_job().unwrap().id, running);
    }

    #[tokio::test]
    async fn history_is_bounded_but_counters_are_not() {
        let q = queue(2, 3);
        let shutdown = CancellationToken::new();
        for _ in 0..10 {
            let id = q.add_job(EntryKind::Training, payload()).unwrap();
            q.get_next_job(&shutdown).await.unwrap();
            q.complete_job(id, true, None);
        }
        let status = q.get_queue_status();
        assert_eq!(status.completed, 10);
        assert_eq!(status.retained, 3);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn concurrent_producers_respect_capacity() {
        let q = Arc::new(queue(4, 10));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.add_job(EntryKind::Training, payload()).is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        assert_eq!(q.get_queue_status().queued, 4);
    }
}
