// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles shared by the integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use hybridcache::{CacheEntryPaths, CleanupManager, KeyedMutex, SpaceReservation};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

/// A recorded cleanup-manager call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOp {
    NotifyUsed(String),
    ContentType(String),
    ReserveSpace {
        string_key: String,
        bytes: u64,
        allow_eviction: bool,
    },
    MarkFileCreated {
        string_key: String,
        bytes: u64,
    },
}

#[derive(Default)]
struct Inner {
    operations: Mutex<Vec<CleanupOp>>,
    content_types: Mutex<HashMap<String, String>>,
    deny_message: Mutex<Option<String>>,
    reserve_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// A [`CleanupManager`] that records every call and supports failure and
/// blocking injection.
#[derive(Clone, Default)]
pub struct RecordingCleanup {
    inner: Arc<Inner>,
}

impl RecordingCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-loads the stored content-type for a key.
    pub fn set_content_type(&self, string_key: &str, content_type: &str) {
        self.inner
            .content_types
            .lock()
            .insert(string_key.to_owned(), content_type.to_owned());
    }

    /// Makes every subsequent reservation fail with `message`.
    pub fn deny_reservations(&self, message: &str) {
        *self.inner.deny_message.lock() = Some(message.to_owned());
    }

    /// Blocks every subsequent reservation until [`release_reservations`]
    /// (keeps queued buffers pending, making memory hits deterministic).
    ///
    /// [`release_reservations`]: Self::release_reservations
    pub fn hold_reservations(&self) {
        *self.inner.reserve_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Unblocks reservations held by [`hold_reservations`](Self::hold_reservations).
    pub fn release_reservations(&self) {
        if let Some(gate) = self.inner.reserve_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    pub fn operations(&self) -> Vec<CleanupOp> {
        self.inner.operations.lock().clone()
    }

    pub fn mark_file_created_count(&self, key: &str) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, CleanupOp::MarkFileCreated { string_key, .. } if string_key == key))
            .count()
    }

    pub fn reserve_count(&self, key: &str) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, CleanupOp::ReserveSpace { string_key, .. } if string_key == key))
            .count()
    }

    fn record(&self, op: CleanupOp) {
        self.inner.operations.lock().push(op);
    }
}

impl CleanupManager for RecordingCleanup {
    fn notify_used(&self, entry: &CacheEntryPaths) {
        self.record(CleanupOp::NotifyUsed(entry.string_key.clone()));
    }

    async fn content_type(
        &self,
        entry: &CacheEntryPaths,
        _cancel: &CancellationToken,
    ) -> hybridcache::Result<Option<String>> {
        self.record(CleanupOp::ContentType(entry.string_key.clone()));
        Ok(self.inner.content_types.lock().get(&entry.string_key).cloned())
    }

    async fn try_reserve_space(
        &self,
        entry: &CacheEntryPaths,
        _content_type: Option<&str>,
        bytes: u64,
        allow_eviction: bool,
        _evict_locks: &KeyedMutex,
        _cancel: &CancellationToken,
    ) -> hybridcache::Result<SpaceReservation> {
        self.record(CleanupOp::ReserveSpace {
            string_key: entry.string_key.clone(),
            bytes,
            allow_eviction,
        });
        let gate = self.inner.reserve_gate.lock().as_ref().map(Arc::clone);
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        match self.inner.deny_message.lock().as_deref() {
            Some(message) => Ok(SpaceReservation::denied(message)),
            None => Ok(SpaceReservation::granted()),
        }
    }

    async fn mark_file_created(
        &self,
        entry: &CacheEntryPaths,
        _content_type: Option<&str>,
        bytes: u64,
        _created: SystemTime,
    ) -> hybridcache::Result<()> {
        self.record(CleanupOp::MarkFileCreated {
            string_key: entry.string_key.clone(),
            bytes,
        });
        Ok(())
    }
}

/// An [`AsyncRead`] that yields its payload only after a release signal, for
/// holding write locks open mid-copy.
pub struct StallingReader {
    released: Option<oneshot::Receiver<()>>,
    payload: &'static [u8],
    done: bool,
}

impl StallingReader {
    /// Returns the reader and the sender that releases it.
    pub fn new(payload: &'static [u8]) -> (Self, oneshot::Sender<()>) {
        let (release, released) = oneshot::channel();
        (
            Self {
                released: Some(released),
                payload,
                done: false,
            },
            release,
        )
    }
}

impl AsyncRead for StallingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(released) = self.released.as_mut() {
            match Pin::new(released).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(_) => self.released = None,
            }
        }
        if !self.done {
            buf.put_slice(self.payload);
            self.done = true;
        }
        Poll::Ready(Ok(()))
    }
}
