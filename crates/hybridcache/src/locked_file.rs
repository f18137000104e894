// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform classification of file-sharing errors and the contended-open retry
//! loop.
//!
//! Serving a cache file that another process is still writing (or scanning with
//! an exclusive lock) fails with a platform-specific sharing violation rather
//! than a clean "not found". This module folds those platform differences into
//! one [`Probe`] answer and provides the bounded poll loop used when a caller is
//! willing to wait the contention out.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;

/// Poll cadence for the contended-open loop: frequent enough to pick the file
/// up quickly, but never more than a third of the total budget.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// The answer from one open attempt on a cache file.
#[derive(Debug)]
pub(crate) enum Probe<T> {
    /// The file opened; here is the handle.
    Opened(T),
    /// The file does not exist (or vanished mid-probe).
    Missing,
    /// The file exists but a concurrent holder blocks the open; retrying may
    /// succeed.
    Locked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorClass {
    NotFound,
    Transient,
    Fatal,
}

/// Sorts an open failure into not-found / transient / fatal.
///
/// Permission-denied reads are treated as transient: some network filesystems
/// report a writer's exclusive hold that way, and a retry is cheap.
fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorClass::NotFound,
        io::ErrorKind::PermissionDenied => ErrorClass::Transient,
        _ => match err.raw_os_error() {
            Some(code) if is_sharing_violation(code) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
    }
}

/// Windows reports a concurrent holder as a sharing or lock violation in the
/// low word of the error code.
#[cfg(windows)]
fn is_sharing_violation(code: i32) -> bool {
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION};

    let low = (code as u32) & 0xFFFF;
    low == ERROR_SHARING_VIOLATION || low == ERROR_LOCK_VIOLATION
}

/// Unix has no mandatory read locks; EAGAIN, EACCES and EBUSY are the errno
/// values that show up as "locked" in practice (EACCES deliberately included
/// for network filesystems that use it in place of EPERM).
#[cfg(unix)]
fn is_sharing_violation(code: i32) -> bool {
    matches!(code, libc::EAGAIN | libc::EACCES | libc::EBUSY)
}

/// Opens `path` read-only with shared-read sharing and a sequential-scan hint.
pub(crate) async fn open_shared_read(path: &Path) -> io::Result<File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use windows_sys::Win32::Storage::FileSystem::{
            FILE_FLAG_SEQUENTIAL_SCAN, FILE_SHARE_READ,
        };

        options.share_mode(FILE_SHARE_READ);
        options.custom_flags(FILE_FLAG_SEQUENTIAL_SCAN);
    }
    options.open(path).await
}

/// One non-blocking probe of an existing cache file.
///
/// # Errors
///
/// Only fatal I/O errors are returned; not-found and lock contention are data.
pub(crate) async fn probe(path: &Path) -> io::Result<Probe<File>> {
    match open_shared_read(path).await {
        Ok(file) => Ok(Probe::Opened(file)),
        Err(err) => match classify(&err) {
            ErrorClass::NotFound => Ok(Probe::Missing),
            ErrorClass::Transient => Ok(Probe::Locked),
            ErrorClass::Fatal => Err(err),
        },
    }
}

/// The poll interval for a given total retry budget.
fn retry_delay(timeout: Duration) -> Duration {
    MAX_POLL_INTERVAL.min(timeout / 3)
}

/// Repeats `attempt` until it opens, the file disappears, or the cumulative
/// wait exceeds `timeout`.
///
/// The first attempt runs immediately; each `Locked` answer costs one poll
/// interval of `min(15ms, timeout / 3)`. `Missing` resolves to `None` at once:
/// a vanished file means a miss, not contention. Timeout also resolves to
/// `None`; the caller falls back to producing the artifact itself.
///
/// Generic over the attempt function so the loop is exercisable on every
/// platform without manufacturing real sharing violations.
///
/// # Errors
///
/// Fatal I/O errors from `attempt` are returned unchanged.
pub(crate) async fn open_when_unlocked<T, F, Fut>(
    mut attempt: F,
    timeout: Duration,
) -> io::Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<Probe<T>>>,
{
    let delay = retry_delay(timeout);
    let mut waited = Duration::ZERO;
    loop {
        match attempt().await? {
            Probe::Opened(file) => return Ok(Some(file)),
            Probe::Missing => return Ok(None),
            Probe::Locked => {
                if waited >= timeout {
                    tracing::debug!(waited_ms = waited.as_millis() as u64, "gave up on locked file");
                    return Ok(None);
                }
                tokio::time::sleep(delay).await;
                waited += delay;
            }
        }
    }
}
