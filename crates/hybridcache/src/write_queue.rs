// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The byte-bounded set of artifacts awaiting their background flush.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::write_buffer::WriteBuffer;

/// Whether an artifact was accepted into the write queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum EnqueueOutcome {
    /// The buffer was inserted and its flush task spawned.
    Enqueued,
    /// Admitting the buffer would exceed the byte budget (or queuing is
    /// disabled); nothing was inserted and no task was spawned.
    QueueFull,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Arc<WriteBuffer>>,
    queued_bytes: u64,
}

/// A mapping from string key to pending [`WriteBuffer`], bounded by total bytes.
///
/// Each successful [`enqueue`](Self::enqueue) spawns the provided flush task;
/// the entry is removed and its bytes released only once that task finishes,
/// whether it succeeded, failed, or panicked. [`await_all`](Self::await_all)
/// drains every task spawned before it resolves, for graceful shutdown.
#[derive(Debug)]
pub struct WriteQueue {
    max_queued_bytes: u64,
    state: Arc<Mutex<State>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Creates a queue admitting at most `max_queued_bytes` of artifact bytes.
    ///
    /// A budget of `0` disables asynchronous queuing: every enqueue reports
    /// [`EnqueueOutcome::QueueFull`].
    #[must_use]
    pub fn new(max_queued_bytes: u64) -> Self {
        Self {
            max_queued_bytes,
            state: Arc::new(Mutex::new(State::default())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Looks up the pending buffer for `string_key`, if any.
    #[must_use]
    pub fn get(&self, string_key: &str) -> Option<Arc<WriteBuffer>> {
        self.state.lock().entries.get(string_key).map(Arc::clone)
    }

    /// The total artifact bytes currently queued.
    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().queued_bytes
    }

    /// Admits `buf` and spawns `flush` to persist it, unless the byte budget
    /// (or an existing entry for the same key) forbids it.
    ///
    /// The spawned task is fire-and-forget from the caller's perspective: a
    /// panic inside `flush` is caught and logged, and the queue entry is
    /// removed on completion either way.
    pub fn enqueue<F>(&self, buf: Arc<WriteBuffer>, flush: F) -> EnqueueOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bytes = buf.used_bytes();
        let string_key = buf.string_key().to_owned();
        {
            let mut state = self.state.lock();
            if self.max_queued_bytes == 0 || state.queued_bytes + bytes > self.max_queued_bytes {
                return EnqueueOutcome::QueueFull;
            }
            if state.entries.contains_key(&string_key) {
                // One pending buffer per key; a duplicate rides the queue-full
                // path and resolves against the existing entry or the disk.
                return EnqueueOutcome::QueueFull;
            }
            state.entries.insert(string_key.clone(), Arc::clone(&buf));
            state.queued_bytes += bytes;
        }

        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            if AssertUnwindSafe(flush).catch_unwind().await.is_err() {
                tracing::error!(%string_key, "flush task panicked");
            }
            let mut state = state.lock();
            if state.entries.remove(&string_key).is_some() {
                state.queued_bytes -= bytes;
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(task);
        EnqueueOutcome::Enqueued
    }

    /// Awaits every flush task spawned before this call resolves.
    ///
    /// Enqueues racing with the call are permitted; any that land before the
    /// drain finishes are awaited too. Intended for graceful shutdown;
    /// without it, in-flight background flushes may be lost at process exit.
    pub async fn await_all(&self) {
        loop {
            let drained = std::mem::take(&mut *self.tasks.lock());
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                // The task wrapper contains panics, so a join error here can
                // only mean the runtime aborted it.
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::oneshot;

    use super::*;
    use crate::write_buffer::Artifact;

    fn buffer(key: &str, payload: &'static [u8]) -> Arc<WriteBuffer> {
        Arc::new(WriteBuffer::new(
            key,
            Artifact::new(Bytes::from_static(payload), None),
        ))
    }

    #[tokio::test]
    async fn enqueue_tracks_bytes_until_flush_completes() {
        let queue = WriteQueue::new(1024);
        let (release, released) = oneshot::channel::<()>();

        let outcome = queue.enqueue(buffer("a", b"12345"), async move {
            let _ = released.await;
        });
        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        assert_eq!(queue.queued_bytes(), 5);
        assert!(queue.get("a").is_some());

        release.send(()).unwrap();
        queue.await_all().await;
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.get("a").is_none());
    }

    #[tokio::test]
    async fn over_budget_enqueue_is_rejected() {
        let queue = WriteQueue::new(4);
        let outcome = queue.enqueue(buffer("a", b"12345"), async {});
        assert_eq!(outcome, EnqueueOutcome::QueueFull);
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.get("a").is_none());
    }

    #[tokio::test]
    async fn zero_budget_disables_queuing() {
        let queue = WriteQueue::new(0);
        let outcome = queue.enqueue(buffer("a", b""), async {});
        assert_eq!(outcome, EnqueueOutcome::QueueFull);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_while_pending() {
        let queue = WriteQueue::new(1024);
        let (release, released) = oneshot::channel::<()>();

        let first = queue.enqueue(buffer("a", b"xy"), async move {
            let _ = released.await;
        });
        assert_eq!(first, EnqueueOutcome::Enqueued);
        let second = queue.enqueue(buffer("a", b"xy"), async {});
        assert_eq!(second, EnqueueOutcome::QueueFull);

        release.send(()).unwrap();
        queue.await_all().await;
    }

    #[tokio::test]
    async fn panicking_flush_still_releases_the_entry() {
        let queue = WriteQueue::new(1024);
        let outcome = queue.enqueue(buffer("a", b"xy"), async {
            panic!("flush exploded");
        });
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        queue.await_all().await;
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.get("a").is_none());
    }

    #[tokio::test]
    async fn await_all_observes_late_enqueues() {
        let queue = Arc::new(WriteQueue::new(1024));

        let first = queue.enqueue(buffer("a", b"x"), {
            let queue = Arc::clone(&queue);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                // Lands while await_all is draining the first batch.
                let _ = queue.enqueue(buffer("b", b"y"), async {});
            }
        });
        assert_eq!(first, EnqueueOutcome::Enqueued);

        queue.await_all().await;
        assert_eq!(queue.queued_bytes(), 0);
        assert!(queue.get("b").is_none());
    }
}
