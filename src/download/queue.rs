//! FIFO job queue with a concurrency cap
//!
//! Local (remux) downloads go through here. Entries wait in FIFO order and are
//! promoted to the active set as slots free up; promotion and the start of
//! `execute` happen together. A failing `execute` is logged and dropped, the
//! scheduler keeps going.
//!
//! Every state change is published as a [`QueueSnapshot`] on a watch channel,
//! which is how the orchestrator persists the queue.

use crate::api::models::MediaItem;
use crate::config::clamp_concurrency;
use crate::error::{OfflineError, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};

/// Deferred work of one entry
pub type ExecuteFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A unit of local work, keyed by item id
pub struct QueueEntry {
    pub id: String,
    pub item: MediaItem,
    execute: ExecuteFn,
}

impl QueueEntry {
    pub fn new<F, Fut>(item: MediaItem, execute: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: item.id.clone(),
            item,
            execute: Box::new(move || Box::pin(execute())),
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Waiting entries, head first
    pub queued: Vec<MediaItem>,
    /// Executing entries, in promotion order
    pub active: Vec<MediaItem>,
    pub concurrency_limit: usize,
}

impl QueueSnapshot {
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.active.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.queued.iter().chain(self.active.iter()).any(|i| i.id == id)
    }
}

struct ActiveEntry {
    item: MediaItem,
    seq: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
}

struct QueueState {
    pending: VecDeque<QueueEntry>,
    active: HashMap<String, ActiveEntry>,
    limit: usize,
    next_seq: u64,
    /// Set by [`JobQueue::close`]; nothing is accepted or promoted afterwards
    closed: bool,
}

impl QueueState {
    fn snapshot(&self) -> QueueSnapshot {
        let mut active: Vec<&ActiveEntry> = self.active.values().collect();
        active.sort_by_key(|a| a.seq);

        QueueSnapshot {
            queued: self.pending.iter().map(|e| e.item.clone()).collect(),
            active: active.into_iter().map(|a| a.item.clone()).collect(),
            concurrency_limit: self.limit,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.pending.iter().any(|e| e.id == id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    changes: watch::Sender<QueueSnapshot>,
}

/// Bounded-concurrency FIFO scheduler
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Create a queue; `limit` is clamped to 1-4
    pub fn new(limit: usize) -> Self {
        let limit = clamp_concurrency(limit);
        let (changes, _) = watch::channel(QueueSnapshot {
            concurrency_limit: limit,
            ..QueueSnapshot::default()
        });

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    active: HashMap::new(),
                    limit,
                    next_seq: 0,
                    closed: false,
                }),
                changes,
            }),
        }
    }

    /// Append an entry unless one with the same id is queued or active
    pub async fn enqueue(&self, entry: QueueEntry) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                tracing::debug!(id = %entry.id, "queue closed, ignoring");
                return false;
            }
            if state.contains(&entry.id) {
                tracing::debug!(id = %entry.id, "already queued, ignoring");
                return false;
            }
            tracing::debug!(id = %entry.id, position = state.pending.len(), "queued");
            state.pending.push_back(entry);
        }

        Self::schedule(&self.inner).await;
        true
    }

    /// Drop a still-queued entry; active entries are untouched
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|e| e.id != id);
        let removed = state.pending.len() != before;

        if removed {
            let _ = self.inner.changes.send(state.snapshot());
        }
        removed
    }

    /// Drop every still-queued entry and return their ids; active entries run on
    pub async fn clear(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        let drained: Vec<String> = state.pending.drain(..).map(|e| e.id).collect();
        if !drained.is_empty() {
            let _ = self.inner.changes.send(state.snapshot());
        }
        drained
    }

    /// Stop accepting and promoting entries, dropping the queued ones
    ///
    /// Active entries finish on their own but free no slot for anything else.
    /// Returns the ids of the dropped entries.
    pub async fn close(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let drained: Vec<String> = state.pending.drain(..).map(|e| e.id).collect();
        tracing::debug!(dropped = drained.len(), active = state.active.len(), "queue closed");
        drained
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Remove a queued entry or signal an active one to stop
    pub async fn cancel(&self, id: &str) -> bool {
        if self.remove(id).await {
            return true;
        }

        let mut state = self.inner.state.lock().await;
        match state.active.get_mut(id).and_then(|a| a.cancel_tx.take()) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Change the limit; raising it promotes waiting entries right away
    pub async fn set_concurrency_limit(&self, limit: usize) {
        {
            let mut state = self.inner.state.lock().await;
            state.limit = clamp_concurrency(limit);
            tracing::debug!(limit = state.limit, "concurrency limit changed");
        }
        Self::schedule(&self.inner).await;
    }

    pub async fn concurrency_limit(&self) -> usize {
        self.inner.state.lock().await.limit
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().await.contains(id)
    }

    /// Number of waiting entries
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    /// True when nothing is queued or active
    pub async fn is_empty(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.pending.is_empty() && state.active.is_empty()
    }

    /// Receiver of every state change
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.inner.changes.subscribe()
    }

    /// Wait until nothing is queued or active
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.is_empty().await {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Promote entries while slots are free
    async fn schedule(inner: &Arc<Inner>) {
        let mut started = Vec::new();
        {
            let mut state = inner.state.lock().await;
            while !state.closed && state.active.len() < state.limit {
                let Some(entry) = state.pending.pop_front() else {
                    break;
                };

                let (cancel_tx, cancel_rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.active.insert(
                    entry.id.clone(),
                    ActiveEntry {
                        item: entry.item.clone(),
                        seq,
                        cancel_tx: Some(cancel_tx),
                    },
                );
                started.push((entry, cancel_rx));
            }
            let _ = inner.changes.send(state.snapshot());
        }

        for (entry, cancel_rx) in started {
            Self::spawn_entry(Arc::clone(inner), entry, cancel_rx);
        }
    }

    fn spawn_entry(inner: Arc<Inner>, entry: QueueEntry, mut cancel_rx: oneshot::Receiver<()>) {
        let QueueEntry { id, execute, .. } = entry;
        let work = execute();

        tokio::spawn(async move {
            tracing::debug!(id = %id, "executing queued entry");

            let result = tokio::select! {
                result = work => result,
                _ = &mut cancel_rx => Err(OfflineError::Cancelled),
            };

            match result {
                Ok(()) => tracing::debug!(id = %id, "queued entry finished"),
                Err(OfflineError::Cancelled) => tracing::info!(id = %id, "queued entry cancelled"),
                Err(e) => tracing::warn!(id = %id, error = %e, "queued entry failed"),
            }

            inner.state.lock().await.active.remove(&id);
            Self::schedule(&inner).await;
        });
    }
}
