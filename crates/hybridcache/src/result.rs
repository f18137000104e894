// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! What a cache request hands back: a readable body plus the path it took.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

/// Which internal path produced a cache result.
///
/// Every request resolves to exactly one of these; tests and operators rely on
/// the mapping being honest (a `MemoryHit` really came from the write queue, a
/// `WriteSucceeded` really renamed a file into place, and so on).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Detail {
    /// Never returned by a completed request; the initial state of a result
    /// under construction.
    Unknown,
    /// Served from a pending write buffer still in the queue.
    MemoryHit,
    /// The cache file existed and opened on the first try.
    DiskHit,
    /// The cache file was locked by a concurrent writer; the retry loop waited
    /// it out and then opened it.
    ContendedDiskHit,
    /// Produced, then flushed to disk synchronously on this request.
    WriteSucceeded,
    /// The queue lock stayed busy, so this request produced its own uncached
    /// copy.
    QueueLockTimeoutAndCreated,
    /// A racing writer persisted the same artifact first.
    FileAlreadyExists,
    /// Produced and returned, but not persisted (either queued for a later
    /// flush or dropped because the queue was full).
    Miss,
    /// The cleanup manager could not reserve disk space; the bytes were
    /// returned but not persisted.
    CacheEvictionFailed,
    /// The per-path write lock stayed busy past its timeout during a
    /// synchronous flush.
    WriteTimedOut,
    /// The queue lock stayed busy and the cache is configured to fail rather
    /// than produce uncached bytes.
    QueueLockTimeoutAndFailed,
    /// The evict-and-write lock stayed busy during a synchronous flush.
    EvictAndWriteLockTimedOut,
}

impl Detail {
    /// Whether the artifact was served from cache (memory or disk).
    #[must_use]
    pub fn is_hit(self) -> bool {
        matches!(self, Self::MemoryHit | Self::DiskHit | Self::ContendedDiskHit)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::MemoryHit => "MemoryHit",
            Self::DiskHit => "DiskHit",
            Self::ContendedDiskHit => "ContendedDiskHit",
            Self::WriteSucceeded => "WriteSucceeded",
            Self::QueueLockTimeoutAndCreated => "QueueLockTimeoutAndCreated",
            Self::FileAlreadyExists => "FileAlreadyExists",
            Self::Miss => "Miss",
            Self::CacheEvictionFailed => "CacheEvictionFailed",
            Self::WriteTimedOut => "WriteTimedOut",
            Self::QueueLockTimeoutAndFailed => "QueueLockTimeoutAndFailed",
            Self::EvictAndWriteLockTimedOut => "EvictAndWriteLockTimedOut",
        }
    }
}

impl std::fmt::Display for Detail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The readable body of a cache result.
///
/// Reading is independent of the cache's subsequent decisions: a `Memory`
/// reader holds its own view of the buffer bytes, and a `Disk` reader holds an
/// open handle that outlives eviction of the path.
#[derive(Debug)]
pub enum CacheReader {
    /// A view over in-memory artifact bytes.
    Memory(Cursor<Bytes>),
    /// An open cache file.
    Disk(File),
}

impl AsyncRead for CacheReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Self::Disk(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

/// The outcome of one `get_or_create` call.
#[derive(Debug)]
pub struct CacheResult {
    pub(crate) detail: Detail,
    pub(crate) body: Option<CacheReader>,
    pub(crate) content_type: Option<String>,
}

impl CacheResult {
    /// Which internal path produced this result.
    #[must_use]
    pub fn detail(&self) -> Detail {
        self.detail
    }

    /// The artifact's content-type, when known.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Whether a readable body is present. Absent only for
    /// [`Detail::QueueLockTimeoutAndFailed`].
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Consumes the result, yielding its readable body.
    #[must_use]
    pub fn into_body(self) -> Option<CacheReader> {
        self.body
    }

    /// Consumes the result, yielding `(detail, body, content_type)`.
    #[must_use]
    pub fn into_parts(self) -> (Detail, Option<CacheReader>, Option<String>) {
        (self.detail, self.body, self.content_type)
    }
}
