// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for [`FileWriter`].

mod common;

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::time::Duration;

use common::StallingReader;
use hybridcache::{
    CacheOptions, Error, FileWriter, HexPathBuilder, PathBuilder, WriteOutcome,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const LONG: Duration = Duration::from_secs(5);

fn entry_for(root: &Path, key: &[u8]) -> hybridcache::CacheEntryPaths {
    HexPathBuilder::new(root).derive(key)
}

fn writer() -> FileWriter {
    FileWriter::new(&CacheOptions::default())
}

async fn file_count(dir: &Path) -> usize {
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    let mut count = 0;
    while entries.next_entry().await.unwrap().is_some() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn creates_the_file_and_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let cancel = CancellationToken::new();

    let outcome = writer()
        .try_write(&entry, Cursor::new(&b"payload"[..]), true, LONG, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::FileCreated);
    assert_eq!(
        tokio::fs::read(&entry.physical_path).await.unwrap(),
        b"payload"
    );
    // No temp file left behind.
    assert_eq!(file_count(entry.physical_path.parent().unwrap()).await, 1);
}

#[tokio::test]
async fn verify_exists_first_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    tokio::fs::create_dir_all(entry.physical_path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&entry.physical_path, b"original").await.unwrap();
    let cancel = CancellationToken::new();

    let outcome = writer()
        .try_write(&entry, Cursor::new(&b"replacement"[..]), true, LONG, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::FileAlreadyExists);
    assert_eq!(
        tokio::fs::read(&entry.physical_path).await.unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn racing_destination_wins_and_the_temp_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    tokio::fs::create_dir_all(entry.physical_path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&entry.physical_path, b"winner").await.unwrap();
    let cancel = CancellationToken::new();

    // Skipping the verify pass exercises the pre-rename existence check.
    let outcome = writer()
        .try_write(&entry, Cursor::new(&b"loser"[..]), false, LONG, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::FileAlreadyExists);
    assert_eq!(tokio::fs::read(&entry.physical_path).await.unwrap(), b"winner");
    assert_eq!(file_count(entry.physical_path.parent().unwrap()).await, 1);
}

#[tokio::test]
async fn concurrent_writer_for_the_same_key_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let writer = Arc::new(writer());
    let cancel = CancellationToken::new();

    let (stalled, release) = StallingReader::new(b"slow");
    let holder = {
        let writer = Arc::clone(&writer);
        let entry = entry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.try_write(&entry, stalled, false, LONG, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = writer
        .try_write(
            &entry,
            Cursor::new(&b"fast"[..]),
            false,
            Duration::from_millis(30),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::LockTimeout);

    release.send(()).unwrap();
    let held = holder.await.unwrap().unwrap();
    assert_eq!(held, WriteOutcome::FileCreated);
    assert_eq!(tokio::fs::read(&entry.physical_path).await.unwrap(), b"slow");
}

#[tokio::test]
async fn direct_mode_uses_create_new_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let writer = FileWriter::new(&CacheOptions {
        move_files_into_place: false,
        ..CacheOptions::default()
    });
    let cancel = CancellationToken::new();

    let first = writer
        .try_write(&entry, Cursor::new(&b"one"[..]), false, LONG, &cancel)
        .await
        .unwrap();
    assert_eq!(first, WriteOutcome::FileCreated);

    let second = writer
        .try_write(&entry, Cursor::new(&b"two"[..]), false, LONG, &cancel)
        .await
        .unwrap();
    assert_eq!(second, WriteOutcome::FileAlreadyExists);
    assert_eq!(tokio::fs::read(&entry.physical_path).await.unwrap(), b"one");
}

#[tokio::test]
async fn overwrite_hook_replaces_the_destination() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    tokio::fs::create_dir_all(entry.physical_path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&entry.physical_path, b"stale").await.unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let writer = FileWriter::new(&CacheOptions {
        move_file_overwrite: Some(Arc::new({
            let invoked = Arc::clone(&invoked);
            move |src: &Path, dst: &Path| {
                invoked.fetch_add(1, AcqRel);
                std::fs::rename(src, dst)
            }
        })),
        ..CacheOptions::default()
    });
    let cancel = CancellationToken::new();

    let outcome = writer
        .try_write(&entry, Cursor::new(&b"fresh"[..]), false, LONG, &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, WriteOutcome::FileCreated);
    assert_eq!(invoked.load(Acquire), 1);
    assert_eq!(tokio::fs::read(&entry.physical_path).await.unwrap(), b"fresh");
}

#[tokio::test]
async fn canceled_token_rejects_the_write() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = writer()
        .try_write(&entry, Cursor::new(&b"payload"[..]), false, LONG, &cancel)
        .await;
    assert!(matches!(outcome.unwrap_err(), Error::Canceled));
    assert!(!entry.physical_path.exists());
}

#[tokio::test]
async fn contended_open_waits_for_the_writer_to_finish() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let writer = Arc::new(writer());
    let cancel = CancellationToken::new();

    let (stalled, release) = StallingReader::new(b"HELLO");
    let holder = {
        let writer = Arc::clone(&writer);
        let entry = entry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.try_write(&entry, stalled, false, LONG, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let released = {
        let release = release;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            release.send(()).unwrap();
        })
    };

    // Blocks on the per-key lock until the writer completes, then opens the
    // freshly renamed file.
    let file = writer
        .open_contended(&entry, LONG, &cancel)
        .await
        .unwrap()
        .expect("file should be readable after the writer finishes");
    let mut contents = Vec::new();
    let mut file = file;
    file.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents, b"HELLO");

    holder.await.unwrap().unwrap();
    released.await.unwrap();
}

#[tokio::test]
async fn contended_open_of_a_missing_file_is_a_fast_miss() {
    let dir = tempfile::tempdir().unwrap();
    let entry = entry_for(dir.path(), b"abc");
    let cancel = CancellationToken::new();

    let opened = writer().open_contended(&entry, LONG, &cancel).await.unwrap();
    assert!(opened.is_none());
}
