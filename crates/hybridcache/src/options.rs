// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A platform-specific atomic-replace hook.
///
/// When configured, the file writer calls this instead of its default
/// rename-if-not-exists policy to move a finished temp file into place. The hook
/// may overwrite an existing destination (e.g. `ReplaceFile` on Windows,
/// `rename(2)` on POSIX). It runs on a blocking worker thread and must not block
/// indefinitely.
pub type MoveFileOverwrite = Arc<dyn Fn(&Path, &Path) -> std::io::Result<()> + Send + Sync>;

/// Tuning knobs for the cache coordination engine.
///
/// The defaults are production-oriented: a 100 MiB write queue, two-second waits
/// on identical requests and identical disk writes, synchronous writes when the
/// queue saturates, and temp-file + rename placement.
#[derive(Clone)]
pub struct CacheOptions {
    /// Upper bound on memory used by unflushed write buffers, in bytes.
    ///
    /// `0` disables asynchronous queuing entirely; every write then follows the
    /// queue-full path (synchronous flush or plain miss, per
    /// [`write_synchronously_when_queue_full`](Self::write_synchronously_when_queue_full)).
    pub max_queued_bytes: u64,

    /// How long a request waits for an identical in-flight request, and how long
    /// a flush waits for the evict-and-write lock of its key.
    pub wait_for_identical_requests: Duration,

    /// How long a writer waits for the per-key file-write lock, and the total
    /// retry budget when an existing cache file is locked by another process.
    pub wait_for_identical_disk_writes: Duration,

    /// When the queue is full: `true` flushes inline on the request task,
    /// `false` returns the bytes uncached with detail `Miss`.
    pub write_synchronously_when_queue_full: bool,

    /// When the queue lock cannot be acquired in time: `true` fails the request
    /// (`QueueLockTimeoutAndFailed`), `false` produces uncached bytes
    /// (`QueueLockTimeoutAndCreated`).
    pub fail_on_enqueue_lock_timeout: bool,

    /// Whether finished artifacts are staged to a temp sibling and renamed into
    /// place. Disabling writes straight to the destination with create-new
    /// semantics.
    pub move_files_into_place: bool,

    /// Optional atomic-replace hook; see [`MoveFileOverwrite`].
    pub move_file_overwrite: Option<MoveFileOverwrite>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_queued_bytes: 100 * 1024 * 1024,
            wait_for_identical_requests: Duration::from_secs(2),
            wait_for_identical_disk_writes: Duration::from_secs(2),
            write_synchronously_when_queue_full: true,
            fail_on_enqueue_lock_timeout: false,
            move_files_into_place: true,
            move_file_overwrite: None,
        }
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("max_queued_bytes", &self.max_queued_bytes)
            .field("wait_for_identical_requests", &self.wait_for_identical_requests)
            .field("wait_for_identical_disk_writes", &self.wait_for_identical_disk_writes)
            .field(
                "write_synchronously_when_queue_full",
                &self.write_synchronously_when_queue_full,
            )
            .field("fail_on_enqueue_lock_timeout", &self.fail_on_enqueue_lock_timeout)
            .field("move_files_into_place", &self.move_files_into_place)
            .field("move_file_overwrite", &self.move_file_overwrite.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_oriented() {
        let options = CacheOptions::default();
        assert_eq!(options.max_queued_bytes, 100 * 1024 * 1024);
        assert!(options.write_synchronously_when_queue_full);
        assert!(!options.fail_on_enqueue_lock_timeout);
        assert!(options.move_files_into_place);
        assert!(options.move_file_overwrite.is_none());
    }

    #[test]
    fn debug_does_not_render_the_hook() {
        let options = CacheOptions {
            move_file_overwrite: Some(Arc::new(|_src, _dst| Ok(()))),
            ..CacheOptions::default()
        };
        let rendered = format!("{options:?}");
        assert!(rendered.contains("move_file_overwrite: true"));
    }
}
