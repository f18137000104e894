// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hybrid memory + disk content-addressed artifact cache core.
//!
//! Given a caller-supplied fingerprint key and a producer callback that can
//! synthesize the artifact bytes, [`HybridCache::get_or_create`] returns the
//! artifact (from disk, from an in-flight write buffer, or by invoking the
//! producer and persisting the result) while deduplicating concurrent
//! identical requests, bounding the memory held by unflushed writes, and
//! cooperating with an injected metadata/eviction layer that bounds disk use.
//!
//! # Anatomy of a request
//!
//! 1. The fingerprint is rendered into paths by the injected [`PathBuilder`]
//!    and usage is reported to the [`CleanupManager`].
//! 2. A lock-free disk probe serves the fast path ([`Detail::DiskHit`]).
//! 3. The request takes the per-key *queue lock*, then re-checks the write
//!    queue ([`Detail::MemoryHit`]) and the disk, this time waiting out a
//!    concurrent writer's file lock if there is one
//!    ([`Detail::ContendedDiskHit`]).
//! 4. On a genuine miss the producer runs (once per key), the bytes are handed
//!    back immediately, and a background flush is queued, or performed inline
//!    when the queue is saturated.
//!
//! Every result carries a [`Detail`] naming the path that produced it, and the
//! returned reader remains valid no matter what the cache decides afterwards.
//!
//! # What is injected
//!
//! The crate is the coordination engine only. Fingerprint-to-path derivation
//! ([`PathBuilder`]) and the metadata database that tracks existence, size,
//! content-type and last use ([`CleanupManager`]) are supplied by the host;
//! [`HexPathBuilder`] and [`NoopCleanup`] are turnkey implementations for
//! simple deployments and tests.
//!
//! # Shutdown
//!
//! Background flushes are fire-and-forget per request but tracked by the
//! cache; call [`HybridCache::await_all`] before process exit or queued
//! artifacts may never reach disk.

mod cache;
mod cleanup;
mod error;
mod file_writer;
mod locked_file;
mod options;
mod paths;
mod result;
mod write_buffer;
mod write_queue;

pub use cache::HybridCache;
pub use cleanup::{CleanupManager, NoopCleanup, SpaceReservation};
pub use error::{Error, Result};
pub use file_writer::{FileWriter, WriteOutcome};
pub use keymutex::{AcquireError, KeyedMutex};
pub use options::{CacheOptions, MoveFileOverwrite};
pub use paths::{CacheEntryPaths, HexPathBuilder, PathBuilder};
pub use result::{CacheReader, CacheResult, Detail};
pub use write_buffer::{Artifact, WriteBuffer};
pub use write_queue::{EnqueueOutcome, WriteQueue};
