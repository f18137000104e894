// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The injected metadata + eviction collaborator.

use std::future::Future;
use std::time::SystemTime;

use keymutex::KeyedMutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::paths::CacheEntryPaths;

/// The answer to a disk-space reservation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceReservation {
    approved: bool,
    message: Option<String>,
}

impl SpaceReservation {
    /// Space is available (possibly after eviction); the write may proceed.
    #[must_use]
    pub fn granted() -> Self {
        Self {
            approved: true,
            message: None,
        }
    }

    /// Space could not be made available; `message` explains why.
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            approved: false,
            message: Some(message.into()),
        }
    }

    /// Whether the write may proceed.
    #[must_use]
    pub fn approved(&self) -> bool {
        self.approved
    }

    /// Diagnostic detail for denied reservations.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Owns the cache-size budget: existence/size/content-type/last-use metadata
/// plus the eviction policy.
///
/// All methods must be safe to call concurrently from any task. The cache core
/// calls them in a fixed pattern: [`notify_used`](Self::notify_used) on every
/// request, [`content_type`](Self::content_type) on disk hits that want one,
/// then [`try_reserve_space`](Self::try_reserve_space) followed by
/// [`mark_file_created`](Self::mark_file_created) during a flush; the latter
/// is called unconditionally, whatever the write outcome.
/// Implementations must therefore treat `mark_file_created` as an upsert; it
/// can describe a file that lost its write race or never landed.
pub trait CleanupManager: Send + Sync + 'static {
    /// Records that `entry` was requested, for LRU accounting. Fire-and-forget:
    /// the cache never waits on this, so implementations should enqueue
    /// internally rather than touch storage inline.
    fn notify_used(&self, entry: &CacheEntryPaths);

    /// Looks up the stored content-type for `entry`, if any.
    fn content_type(
        &self,
        entry: &CacheEntryPaths,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Ensures `bytes` more bytes fit under the cache-size limit, evicting older
    /// entries when `allow_eviction` permits.
    ///
    /// Evicting implementations must guard each candidate with its per-key
    /// entry in `evict_locks` (the same registry the flush path locks its own
    /// key in), so a file being read or written is never deleted under the
    /// same key. Candidates whose lock is busy must be skipped (try-style
    /// acquisition), never awaited: the caller may already hold its own key's
    /// lock.
    fn try_reserve_space(
        &self,
        entry: &CacheEntryPaths,
        content_type: Option<&str>,
        bytes: u64,
        allow_eviction: bool,
        evict_locks: &KeyedMutex,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<SpaceReservation>> + Send;

    /// Persists the metadata row for a flushed entry.
    fn mark_file_created(
        &self,
        entry: &CacheEntryPaths,
        content_type: Option<&str>,
        bytes: u64,
        created: SystemTime,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A [`CleanupManager`] that approves everything and records nothing.
///
/// For hosts that bound disk usage externally (or not at all); also the
/// baseline the test doubles are built on.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCleanup;

impl CleanupManager for NoopCleanup {
    fn notify_used(&self, _entry: &CacheEntryPaths) {}

    async fn content_type(
        &self,
        _entry: &CacheEntryPaths,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn try_reserve_space(
        &self,
        _entry: &CacheEntryPaths,
        _content_type: Option<&str>,
        _bytes: u64,
        _allow_eviction: bool,
        _evict_locks: &KeyedMutex,
        _cancel: &CancellationToken,
    ) -> Result<SpaceReservation> {
        Ok(SpaceReservation::granted())
    }

    async fn mark_file_created(
        &self,
        _entry: &CacheEntryPaths,
        _content_type: Option<&str>,
        _bytes: u64,
        _created: SystemTime,
    ) -> Result<()> {
        Ok(())
    }
}
