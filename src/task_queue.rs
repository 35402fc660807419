//! Priority-ordered serial executor.
//!
//! At most one work item runs at a time. Higher priorities drain first and
//! equal priorities keep insertion order. A failing or panicking item is
//! logged and the queue moves on.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::UnixTimeMs;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TaskWork = BoxFuture<'static, Result<(), TaskError>>;

pub struct QueuedTask {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub enqueued_at: UnixTimeMs,
    seq: u64,
    work: TaskWork,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    backlog: BinaryHeap<QueuedTask>,
    running: bool,
}

#[derive(Debug, Default)]
pub struct TaskQueueMetrics {
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

struct Inner {
    state: Mutex<QueueState>,
    idle: Notify,
    next_seq: AtomicU64,
    metrics: TaskQueueMetrics,
}

/// Cheap to clone; clones share one backlog.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
                next_seq: AtomicU64::new(0),
                metrics: TaskQueueMetrics::default(),
            }),
        }
    }

    /// Queue `work`. Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, priority: TaskPriority, work: F) -> TaskId
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = TaskId::generate();
        let task = QueuedTask {
            id: id.clone(),
            priority,
            enqueued_at: UnixTimeMs::now(),
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            work: Box::pin(work),
        };

        let start_worker = {
            let mut state = self.lock();
            state.backlog.push(task);
            !std::mem::replace(&mut state.running, true)
        };

        self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("task_queue.enqueued").increment(1);
        debug!(task_id = %id, ?priority, "task enqueued");

        if start_worker {
            tokio::spawn(Self::drain(self.inner.clone()));
        }
        id
    }

    /// Drops pending items; a running item is left to finish.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            let dropped = state.backlog.len();
            state.backlog.clear();
            dropped
        };
        self.inner
            .metrics
            .dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            debug!(dropped, "task queue cleared");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.running && state.backlog.is_empty()
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn completed_count(&self) -> u64 {
        self.inner.metrics.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.inner.metrics.failed.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock_state(&self.inner)
    }

    async fn drain(inner: Arc<Inner>) {
        let mut guard = DrainGuard {
            inner: inner.clone(),
            exhausted: false,
        };

        loop {
            let next = {
                let mut state = lock_state(&inner);
                match state.backlog.pop() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        guard.exhausted = true;
                        break;
                    }
                }
            };

            let QueuedTask {
                id, priority, work, ..
            } = next;

            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) => {
                    inner.metrics.completed.fetch_add(1, Ordering::Relaxed);
                    counter!("task_queue.completed").increment(1);
                    debug!(task_id = %id, ?priority, "task completed");
                }
                Ok(Err(e)) => {
                    inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("task_queue.failed").increment(1);
                    warn!(task_id = %id, ?priority, error = %e, "task failed");
                }
                Err(_) => {
                    inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("task_queue.failed").increment(1);
                    warn!(task_id = %id, ?priority, "task panicked");
                }
            }
        }
    }
}

/// Clears `running` if the worker is dropped mid-backlog, so the next
/// `enqueue` spawns a fresh one. Waiters are woken on every exit.
struct DrainGuard {
    inner: Arc<Inner>,
    exhausted: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.exhausted {
            lock_state(&self.inner).running = false;
            warn!("task queue worker stopped before the backlog drained");
        }
        self.inner.idle.notify_waiters();
    }
}

// A poisoned lock only means a panic elsewhere; the heap itself is still valid.
fn lock_state(inner: &Inner) -> MutexGuard<'_, QueueState> {
    inner
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskQueue")
            .field("pending", &state.backlog.len())
            .field("running", &state.running)
            .finish()
    }
}
