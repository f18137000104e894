// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The coordinator: request dedup, the memory/disk re-check protocol, and the
//! flush path.

use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use keymutex::{AcquireError, KeyedMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cleanup::CleanupManager;
use crate::error::{Error, Result};
use crate::file_writer::{FileWriter, WriteOutcome};
use crate::locked_file::{self, Probe};
use crate::options::CacheOptions;
use crate::paths::{CacheEntryPaths, PathBuilder};
use crate::result::{CacheReader, CacheResult, Detail};
use crate::write_buffer::{Artifact, WriteBuffer};
use crate::write_queue::{EnqueueOutcome, WriteQueue};

/// Everything the request path and the spawned flush tasks share.
struct Engine<C, P> {
    options: CacheOptions,
    paths: P,
    cleanup: C,
    queue: WriteQueue,
    queue_locks: KeyedMutex,
    evict_and_write_locks: KeyedMutex,
    writer: FileWriter,
}

/// A hybrid memory + disk content-addressed artifact cache.
///
/// [`get_or_create`](Self::get_or_create) is the sole entry point: it returns
/// the artifact for a fingerprint key from disk, from an in-flight write
/// buffer, or by invoking the caller's producer, which runs at
/// most once across concurrent identical requests (short of a queue-lock
/// timeout, which each result's [`Detail`] reports honestly).
///
/// Three per-key lock domains keep the moving parts composed: the *queue lock*
/// serializes identical requests through the dedup section, the *file-write
/// lock* serializes disk mutation per path, and the *evict-and-write lock*
/// fences space reservation against eviction of an entry that is being read or
/// written.
///
/// Cloning is cheap and shares all state.
///
/// # Examples
///
/// ```no_run
/// use bytes::Bytes;
/// use hybridcache::{Artifact, CacheOptions, HexPathBuilder, HybridCache, NoopCleanup};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> hybridcache::Result<()> {
/// let cache = HybridCache::new(
///     CacheOptions::default(),
///     HexPathBuilder::new("/var/cache/derivatives"),
///     NoopCleanup,
/// );
///
/// let result = cache
///     .get_or_create(
///         b"fingerprint",
///         |_cancel| async { Ok(Artifact::new(Bytes::from_static(b"XY"), None)) },
///         &CancellationToken::new(),
///         false,
///     )
///     .await?;
/// assert!(result.has_body());
/// # Ok(())
/// # }
/// ```
pub struct HybridCache<C, P> {
    inner: Arc<Engine<C, P>>,
}

impl<C, P> Clone for HybridCache<C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, P> std::fmt::Debug for HybridCache<C, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("options", &self.inner.options)
            .field("queued_bytes", &self.inner.queue.queued_bytes())
            .finish_non_exhaustive()
    }
}

impl<C, P> HybridCache<C, P>
where
    C: CleanupManager,
    P: PathBuilder,
{
    /// Creates a cache from its configuration and injected collaborators.
    #[must_use]
    pub fn new(options: CacheOptions, paths: P, cleanup: C) -> Self {
        let writer = FileWriter::new(&options);
        let queue = WriteQueue::new(options.max_queued_bytes);
        Self {
            inner: Arc::new(Engine {
                options,
                paths,
                cleanup,
                queue,
                queue_locks: KeyedMutex::new(),
                evict_and_write_locks: KeyedMutex::new(),
                writer,
            }),
        }
    }

    /// The configuration this cache was built with.
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Awaits every background flush spawned before this call resolves.
    ///
    /// Call before process exit; otherwise in-flight flushes may be lost.
    pub async fn await_all(&self) {
        self.inner.queue.await_all().await;
    }

    /// Returns the artifact for `key`, producing and persisting it on a miss.
    ///
    /// `producer` receives a clone of `cancel` and is invoked at most once per
    /// key across concurrent identical requests, except after a queue-lock
    /// timeout (see [`Detail::QueueLockTimeoutAndCreated`]). The returned
    /// reader stays valid regardless of what the cache decides to do with the
    /// artifact afterwards. `want_content_type` controls whether disk hits pay
    /// for a content-type lookup in the cleanup manager.
    ///
    /// # Errors
    ///
    /// [`Error::Canceled`] when `cancel` fires, [`Error::Producer`] when the
    /// producer fails (the cache is left unmodified), and I/O errors from the
    /// read path or from a synchronous flush.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &[u8],
        producer: F,
        cancel: &CancellationToken,
        want_content_type: bool,
    ) -> Result<CacheResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Artifact>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let entry = self.inner.paths.derive(key);

        // LRU bookkeeping; fire-and-forget by contract.
        self.inner.cleanup.notify_used(&entry);

        // Fast probe, no lock. A locked file falls through to the synchronized
        // re-check instead of stalling here.
        match locked_file::probe(&entry.physical_path).await? {
            Probe::Opened(file) => {
                return self
                    .disk_hit(file, Detail::DiskHit, &entry, want_content_type, cancel)
                    .await;
            }
            Probe::Missing | Probe::Locked => {}
        }

        let request_wait = self.inner.options.wait_for_identical_requests;
        let _queue_guard = match self
            .inner
            .queue_locks
            .lock(&entry.string_key, request_wait, cancel)
            .await
        {
            Ok(guard) => guard,
            Err(AcquireError::Canceled) => return Err(Error::Canceled),
            Err(AcquireError::TimedOut) => {
                return self.produce_unqueued(entry, producer, cancel).await;
            }
            Err(_) => unreachable!("keymutex::AcquireError has no other variants"),
        };
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        // An identical request may have queued the artifact while we waited.
        if let Some(existing) = self.inner.queue.get(&entry.string_key) {
            return Ok(CacheResult {
                detail: Detail::MemoryHit,
                content_type: existing.content_type().map(str::to_owned),
                body: Some(CacheReader::Memory(existing.reader())),
            });
        }

        // ... or already persisted it. This time a locked file is worth waiting
        // out: whoever holds it is writing the bytes we want.
        match locked_file::probe(&entry.physical_path).await? {
            Probe::Opened(file) => {
                return self
                    .disk_hit(file, Detail::DiskHit, &entry, want_content_type, cancel)
                    .await;
            }
            Probe::Locked => {
                let disk_wait = self.inner.options.wait_for_identical_disk_writes;
                if let Some(file) = self.inner.writer.open_contended(&entry, disk_wait, cancel).await? {
                    return self
                        .disk_hit(file, Detail::ContendedDiskHit, &entry, want_content_type, cancel)
                        .await;
                }
            }
            Probe::Missing => {}
        }
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let produce_started = Instant::now();
        let artifact = producer(cancel.clone()).await?;
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let data_creation_elapsed = produce_started.elapsed();

        let buf = Arc::new(WriteBuffer::new(entry.string_key.clone(), artifact));
        let mut result = CacheResult {
            detail: Detail::Miss,
            content_type: buf.content_type().map(str::to_owned),
            body: Some(CacheReader::Memory(buf.reader())),
        };

        let background = FlushJob {
            engine: Arc::clone(&self.inner),
            entry: entry.clone(),
            buf: Arc::clone(&buf),
            data_creation_elapsed,
        };
        let outcome = self.inner.queue.enqueue(Arc::clone(&buf), background.run_detached());
        if outcome == EnqueueOutcome::QueueFull {
            if self.inner.options.write_synchronously_when_queue_full {
                let job = FlushJob {
                    engine: Arc::clone(&self.inner),
                    entry,
                    buf,
                    data_creation_elapsed,
                };
                result.detail = job.run_synchronized(true, cancel).await?;
            } else {
                debug!(entry = %entry.relative_path, "write queue full; returning uncached bytes");
            }
        }
        Ok(result)
    }

    /// The queue-lock-timeout fallback: produce without touching the cache, or
    /// fail outright, per configuration.
    async fn produce_unqueued<F, Fut>(
        &self,
        entry: CacheEntryPaths,
        producer: F,
        cancel: &CancellationToken,
    ) -> Result<CacheResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Artifact>>,
    {
        if self.inner.options.fail_on_enqueue_lock_timeout {
            warn!(entry = %entry.relative_path, "queue lock timed out; failing request");
            return Ok(CacheResult {
                detail: Detail::QueueLockTimeoutAndFailed,
                body: None,
                content_type: None,
            });
        }
        warn!(entry = %entry.relative_path, "queue lock timed out; producing uncached bytes");
        let Artifact { bytes, content_type } = producer(cancel.clone()).await?;
        Ok(CacheResult {
            detail: Detail::QueueLockTimeoutAndCreated,
            content_type,
            body: Some(CacheReader::Memory(Cursor::new(bytes))),
        })
    }

    async fn disk_hit(
        &self,
        file: tokio::fs::File,
        detail: Detail,
        entry: &CacheEntryPaths,
        want_content_type: bool,
        cancel: &CancellationToken,
    ) -> Result<CacheResult> {
        let content_type = if want_content_type {
            self.inner.cleanup.content_type(entry, cancel).await?
        } else {
            None
        };
        debug!(entry = %entry.relative_path, %detail, "served from disk");
        Ok(CacheResult {
            detail,
            content_type,
            body: Some(CacheReader::Disk(file)),
        })
    }
}

/// One flush of one buffer: space reservation, the disk write, and the
/// metadata record, fenced by the entry's evict-and-write lock.
struct FlushJob<C, P> {
    engine: Arc<Engine<C, P>>,
    entry: CacheEntryPaths,
    buf: Arc<WriteBuffer>,
    data_creation_elapsed: Duration,
}

impl<C, P> FlushJob<C, P>
where
    C: CleanupManager,
    P: PathBuilder,
{
    /// The background form: runs under its own never-cancelled token (an
    /// aborted request must not tear down a flush already under way) and
    /// reports failures to the log only.
    async fn run_detached(self) {
        let cancel = CancellationToken::new();
        match self.run_synchronized(false, &cancel).await {
            Ok(detail) => {
                debug!(entry = %self.entry.relative_path, %detail, "background flush finished");
            }
            Err(err) => {
                warn!(entry = %self.entry.relative_path, error = %err, "background flush failed");
            }
        }
    }

    /// Wraps [`flush`](Self::flush) in the entry's evict-and-write lock.
    async fn run_synchronized(&self, queue_full: bool, cancel: &CancellationToken) -> Result<Detail> {
        let wait = self.engine.options.wait_for_identical_requests;
        match self
            .engine
            .evict_and_write_locks
            .try_execute(&self.entry.string_key, wait, cancel, self.flush(queue_full, cancel))
            .await
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                warn!(entry = %self.entry.relative_path, "evict-and-write lock timed out");
                Ok(Detail::EvictAndWriteLockTimedOut)
            }
            Err(_) => Err(Error::Canceled),
        }
    }

    async fn flush(&self, queue_full: bool, cancel: &CancellationToken) -> Result<Detail> {
        let engine = &*self.engine;

        // Background flushes never evict; only the synchronous path does.
        let allow_eviction = queue_full || engine.options.max_queued_bytes == 0;
        let reservation = engine
            .cleanup
            .try_reserve_space(
                &self.entry,
                self.buf.content_type(),
                self.buf.used_bytes(),
                allow_eviction,
                &engine.evict_and_write_locks,
                cancel,
            )
            .await?;
        if !reservation.approved() {
            warn!(
                entry = %self.entry.relative_path,
                reason = reservation.message().unwrap_or("unspecified"),
                "could not reserve cache space"
            );
            return Ok(Detail::CacheEvictionFailed);
        }

        // The background path re-verifies existence: a racing request may have
        // persisted this artifact since the buffer was queued. The synchronous
        // path skips it - the disk re-check under the queue lock just happened.
        let write = engine
            .writer
            .try_write(
                &self.entry,
                self.buf.reader(),
                !queue_full,
                engine.options.wait_for_identical_disk_writes,
                cancel,
            )
            .await?;

        // The metadata row is recorded whatever the write outcome.
        engine
            .cleanup
            .mark_file_created(
                &self.entry,
                self.buf.content_type(),
                self.buf.used_bytes(),
                SystemTime::now(),
            )
            .await?;

        Ok(match write {
            WriteOutcome::FileCreated => {
                debug!(
                    entry = %self.entry.relative_path,
                    bytes = self.buf.used_bytes(),
                    produce_ms = self.data_creation_elapsed.as_millis() as u64,
                    "artifact written"
                );
                Detail::WriteSucceeded
            }
            WriteOutcome::FileAlreadyExists => Detail::FileAlreadyExists,
            WriteOutcome::LockTimeout => Detail::WriteTimedOut,
        })
    }
}
