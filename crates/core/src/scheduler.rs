// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded-concurrency priority scheduler.
//!
//! Jobs wait in a priority heap (higher first, ties in arrival order) and
//! at most `limit` of them run at once as tokio tasks. Each finished job
//! immediately admits the next one. A job that fails or panics only
//! affects its own [`TaskHandle`].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tokio::sync::{broadcast, oneshot, watch};

use crate::error::Result;
use crate::transport::BoxFuture;

/// Default number of jobs running at once.
pub const DEFAULT_CONCURRENCY: usize = 3;

const EVENT_CAPACITY: usize = 1024;

/// Identifies a scheduled job.
pub type TaskId = u64;

/// Why a job produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    /// The scheduler went away before the job reported back.
    #[error("task cancelled")]
    Cancelled,
}

/// Lifecycle notifications, see [`ConcurrencyScheduler::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Completed { id: TaskId },
    Failed { id: TaskId, error: String },
}

/// Resolves to the job's result once it has run.
pub struct TaskHandle<T> {
    id: TaskId,
    rx: oneshot::Receiver<std::result::Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = std::result::Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A waiting job. Runs its body and reports an error message, if any.
struct Queued {
    priority: i32,
    seq: u64,
    id: TaskId,
    job: BoxFuture<'static, Option<String>>,
}

impl Queued {
    fn rank(&self) -> (i32, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Queued>,
    active: usize,
    next_seq: u64,
}

struct Inner {
    limit: usize,
    state: Mutex<State>,
    events: broadcast::Sender<SchedulerEvent>,
    /// Queued plus running jobs.
    load: watch::Sender<usize>,
}

/// Runs async jobs by priority with at most `limit` in flight.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct ConcurrencyScheduler {
    inner: Arc<Inner>,
}

impl Default for ConcurrencyScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ConcurrencyScheduler {
    /// Creates a scheduler running up to `limit` jobs at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (load, _) = watch::channel(0);
        ConcurrencyScheduler {
            inner: Arc::new(Inner {
                limit: limit.max(1),
                state: Mutex::new(State::default()),
                events,
                load,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Schedules `job` and returns a handle to its result.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F>(&self, priority: i32, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let body: BoxFuture<'static, Option<String>> = Box::pin(async move {
            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Failed(e.to_string())),
                Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            };
            let error = outcome.as_ref().err().map(|e| e.to_string());
            // The caller may have dropped its handle
            let _ = tx.send(outcome);
            error
        });

        let id = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Queued { priority, seq, id: seq, job: body });
            self.inner.load.send_replace(state.queue.len() + state.active);
            seq
        };
        tracing::trace!(task = id, priority, "task queued");

        Self::pump(&self.inner);
        TaskHandle { id, rx }
    }

    /// Starts queued jobs while there is capacity.
    fn pump(inner: &Arc<Inner>) {
        loop {
            let next = {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.active >= inner.limit {
                    return;
                }
                let Some(next) = state.queue.pop() else {
                    return;
                };
                state.active += 1;
                next
            };

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let Queued { id, job, .. } = next;
                let error = job.await;

                {
                    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.active -= 1;
                    inner.load.send_replace(state.queue.len() + state.active);
                }

                let event = match error {
                    None => SchedulerEvent::Completed { id },
                    Some(error) => {
                        tracing::debug!(task = id, %error, "task failed");
                        SchedulerEvent::Failed { id, error }
                    }
                };
                // No subscribers is fine
                let _ = inner.events.send(event);

                Self::pump(&inner);
            });
        }
    }

    /// Subscribes to completion and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Number of jobs waiting to start.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs currently running.
    pub fn active(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    /// Resolves once nothing is queued or running.
    pub async fn idle(&self) {
        let mut load = self.inner.load.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail
        let _ = load.wait_for(|n| *n == 0).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
