// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Persisting finished artifacts: temp-file staging and atomic placement under a
//! per-path write lock.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keymutex::{AcquireError, KeyedMutex};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::locked_file;
use crate::options::{CacheOptions, MoveFileOverwrite};
use crate::paths::CacheEntryPaths;

/// How a write attempt concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum WriteOutcome {
    /// The artifact is now on disk at its physical path.
    FileCreated,
    /// Another writer got there first; the destination was left untouched.
    FileAlreadyExists,
    /// The per-path write lock stayed busy past the timeout; nothing was
    /// written.
    LockTimeout,
}

/// Writes artifacts to their cache paths without ever exposing a partial file.
///
/// All disk mutation for a given `string_key` happens under that key's entry in
/// an internal lock registry, so concurrent writers for the same path serialize
/// and the contended-read wait loop (see [`open_contended`](Self::open_contended))
/// can never race the very writer it is waiting for.
pub struct FileWriter {
    locks: KeyedMutex,
    move_files_into_place: bool,
    move_file_overwrite: Option<MoveFileOverwrite>,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("locks", &self.locks)
            .field("move_files_into_place", &self.move_files_into_place)
            .field("move_file_overwrite", &self.move_file_overwrite.is_some())
            .finish()
    }
}

impl FileWriter {
    /// Creates a writer configured from `options`.
    #[must_use]
    pub fn new(options: &CacheOptions) -> Self {
        Self {
            locks: KeyedMutex::new(),
            move_files_into_place: options.move_files_into_place,
            move_file_overwrite: options.move_file_overwrite.clone(),
        }
    }

    /// Writes `source` to `entry.physical_path`, taking the per-path lock for at
    /// most `timeout`.
    ///
    /// With `verify_exists_first`, an already-present destination short-circuits
    /// to [`WriteOutcome::FileAlreadyExists`] before any bytes are staged; the
    /// background flush path uses this, since a racing request may have
    /// persisted the same artifact after it was queued.
    ///
    /// # Errors
    ///
    /// Propagates any I/O failure and [`Error::Canceled`] when `cancel` fires
    /// while waiting for the lock. Lock timeout is an outcome, not an error.
    pub async fn try_write<R>(
        &self,
        entry: &CacheEntryPaths,
        mut source: R,
        verify_exists_first: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _guard = match self.locks.lock(&entry.string_key, timeout, cancel).await {
            Ok(guard) => guard,
            Err(AcquireError::TimedOut) => return Ok(WriteOutcome::LockTimeout),
            Err(AcquireError::Canceled) => return Err(Error::Canceled),
            Err(_) => unreachable!("keymutex::AcquireError has no other variants"),
        };

        if verify_exists_first && tokio::fs::try_exists(&entry.physical_path).await? {
            return Ok(WriteOutcome::FileAlreadyExists);
        }
        if let Some(parent) = entry.physical_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if !self.move_files_into_place {
            return write_direct(&entry.physical_path, &mut source).await;
        }

        let temp = temp_sibling(&entry.physical_path);
        if let Err(err) = stage(&temp, &mut source).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }
        self.place(entry, &temp).await
    }

    /// Waits for a locked cache file to become readable, inside the same
    /// per-path lock that writers take.
    ///
    /// Returns `Ok(None)` when the file vanished, the retry budget ran out, or
    /// the write lock itself stayed busy past `timeout`, all of which the
    /// caller treats as a miss.
    ///
    /// # Errors
    ///
    /// Propagates fatal I/O errors and [`Error::Canceled`].
    pub async fn open_contended(
        &self,
        entry: &CacheEntryPaths,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<File>> {
        let wait = locked_file::open_when_unlocked(|| locked_file::probe(&entry.physical_path), timeout);
        match self.locks.try_execute(&entry.string_key, timeout, cancel, wait).await {
            Ok(Some(opened)) => Ok(opened?),
            Ok(None) => {
                tracing::debug!(
                    entry = %entry.relative_path,
                    "write lock busy; treating locked file as a miss"
                );
                Ok(None)
            }
            Err(_) => Err(Error::Canceled),
        }
    }

    /// Moves a fully staged temp file to its destination.
    async fn place(&self, entry: &CacheEntryPaths, temp: &Path) -> Result<WriteOutcome> {
        if let Some(overwrite) = &self.move_file_overwrite {
            let hook = Arc::clone(overwrite);
            let src = temp.to_path_buf();
            let dst = entry.physical_path.clone();
            tokio::task::spawn_blocking(move || hook(&src, &dst))
                .await
                .map_err(io::Error::other)??;
            return Ok(WriteOutcome::FileCreated);
        }

        if tokio::fs::try_exists(&entry.physical_path).await? {
            // Lost the race after staging; the winner wrote byte-identical content.
            let _ = tokio::fs::remove_file(temp).await;
            return Ok(WriteOutcome::FileAlreadyExists);
        }
        match tokio::fs::rename(temp, &entry.physical_path).await {
            Ok(()) => Ok(WriteOutcome::FileCreated),
            Err(err) => {
                let _ = tokio::fs::remove_file(temp).await;
                Err(err.into())
            }
        }
    }
}

/// Streams `source` into a freshly created `temp` file.
async fn stage<R>(temp: &Path, source: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(temp).await?;
    tokio::io::copy(source, &mut file).await?;
    file.flush().await
}

/// Writes straight to the destination with create-new semantics
/// (`move_files_into_place` disabled).
async fn write_direct<R>(path: &Path, source: &mut R) -> Result<WriteOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(WriteOutcome::FileAlreadyExists);
        }
        Err(err) => return Err(err.into()),
    };
    let written: io::Result<()> = async {
        tokio::io::copy(source, &mut file).await?;
        file.flush().await
    }
    .await;
    if let Err(err) = written {
        drop(file);
        // Readers must never see the torn file.
        let _ = tokio::fs::remove_file(path).await;
        return Err(err.into());
    }
    Ok(WriteOutcome::FileCreated)
}

/// A unique temp path next to `path`, so the final rename stays on one
/// filesystem.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("entry"), ToOwned::to_owned);
    name.push(format!(".{:08x}.tmp", fastrand::u32(..)));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_siblings_share_the_parent_directory() {
        let temp = temp_sibling(Path::new("/cache/ab/cd/abcd.bin"));
        assert_eq!(temp.parent(), Some(Path::new("/cache/ab/cd")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("abcd.bin."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn temp_siblings_are_unique() {
        let path = Path::new("/cache/abcd.bin");
        assert_ne!(temp_sibling(path), temp_sibling(path));
    }
}
