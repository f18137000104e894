// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Named asynchronous mutexes with timeouts and reference-counted cleanup.
//!
//! This crate provides [`KeyedMutex`], a registry that hands out mutual exclusion per
//! *name*: at most one task runs with the lock held for a given name at any moment,
//! while tasks using unrelated names proceed fully in parallel.
//!
//! # When to Use
//!
//! Use a `KeyedMutex` when the set of resources to serialize on is dynamic and
//! unbounded, so a fixed set of mutexes will not do:
//!
//! - **Request deduplication**: serialize concurrent requests for the same cache key
//! - **File writes**: allow one writer per path while other paths stay unblocked
//! - **Eviction fencing**: keep an evictor and a writer for the same entry apart
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use keymutex::KeyedMutex;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let locks = KeyedMutex::new();
//! let cancel = CancellationToken::new();
//!
//! let guard = locks
//!     .lock("user:123", Duration::from_secs(1), &cancel)
//!     .await
//!     .unwrap();
//! // exclusive section for "user:123"
//! drop(guard);
//! # }
//! ```
//!
//! # Lifecycle
//!
//! Registry entries are created lazily on first use and removed when the last holder
//! *or waiter* releases its reference. A waiter always holds a reference to the entry
//! it waits on, so a concurrent release can never garbage-collect the mutex out from
//! under it: either the waiter acquires the existing mutex, or the entry it observed
//! is the one that is removed only after the waiter itself gives up.
//!
//! # Fairness
//!
//! Waiters are queued by the underlying [`tokio::sync::Mutex`], which is FIFO-fair,
//! so starvation is bounded by the number of earlier waiters.
//!
//! # Names
//!
//! Names are compared verbatim. Callers that need case-insensitive behavior must
//! canonicalize names before use.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::AcqRel};
use std::time::Duration;

use dashmap::{
    DashMap,
    Entry::{Occupied, Vacant},
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// The reason a lock could not be acquired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AcquireError {
    /// The lock was not released by its current holder within the allotted time.
    #[error("timed out waiting for keyed mutex")]
    TimedOut,

    /// The supplied cancellation token fired while waiting for the lock.
    #[error("canceled while waiting for keyed mutex")]
    Canceled,
}

/// One registry slot: the shared mutex plus the number of holders and waiters
/// currently referencing it.
#[derive(Debug)]
struct Slot {
    mutex: Arc<Mutex<()>>,
    refs: AtomicUsize,
}

/// A registry of named asynchronous mutexes.
///
/// Locks are identified by string name. Entries are created on demand and removed
/// once no task holds or waits on them, keeping the registry small regardless of
/// how many distinct names pass through over time.
///
/// Cloning is not provided; share the registry behind an `Arc` (or by reference)
/// instead.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    entries: DashMap<String, Slot>,
}

impl KeyedMutex {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the mutex for `name`, waiting at most `timeout`.
    ///
    /// The returned guard releases the mutex when dropped. Dropping the last guard
    /// or waiter for a name removes its registry entry.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::TimedOut`] if the lock could not be acquired within
    /// `timeout`, and [`AcquireError::Canceled`] if `cancel` fired first.
    pub async fn lock(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<KeyedMutexGuard<'_>, AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Canceled);
        }
        let checkout = self.checkout(name);
        let mutex = Arc::clone(&checkout.mutex);
        tokio::select! {
            () = cancel.cancelled() => Err(AcquireError::Canceled),
            acquired = tokio::time::timeout(timeout, mutex.lock_owned()) => match acquired {
                Ok(permit) => Ok(KeyedMutexGuard {
                    _permit: permit,
                    _checkout: checkout,
                }),
                Err(_) => Err(AcquireError::TimedOut),
            },
        }
    }

    /// Runs `body` with the mutex for `name` held.
    ///
    /// Returns `Ok(Some(output))` when the lock was acquired and the body ran, and
    /// `Ok(None)` when the lock could not be acquired within `timeout`. Cancellation
    /// of `body` itself is the body's responsibility; `cancel` only interrupts the
    /// wait for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Canceled`] if `cancel` fired while waiting.
    pub async fn try_execute<T, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        body: Fut,
    ) -> Result<Option<T>, AcquireError>
    where
        Fut: Future<Output = T>,
    {
        match self.lock(name, timeout, cancel).await {
            Ok(_guard) => Ok(Some(body.await)),
            Err(AcquireError::TimedOut) => Ok(None),
            Err(err @ AcquireError::Canceled) => Err(err),
        }
    }

    /// Returns the number of names with a live holder or waiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no name currently has a holder or waiter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers interest in `name`, creating the slot if needed.
    ///
    /// The reference is taken under the map shard lock, so it is impossible for a
    /// release on another task to observe a zero count and remove the slot in
    /// between lookup and increment.
    fn checkout(&self, name: &str) -> Checkout<'_> {
        let mutex = match self.entries.entry(name.to_owned()) {
            Occupied(entry) => {
                entry.get().refs.fetch_add(1, AcqRel);
                Arc::clone(&entry.get().mutex)
            }
            Vacant(entry) => {
                let mutex = Arc::new(Mutex::new(()));
                entry.insert(Slot {
                    mutex: Arc::clone(&mutex),
                    refs: AtomicUsize::new(1),
                });
                mutex
            }
        };
        Checkout {
            entries: &self.entries,
            name: name.to_owned(),
            mutex,
        }
    }
}

/// A live reference to a registry slot; releases it on drop.
#[derive(Debug)]
struct Checkout<'a> {
    entries: &'a DashMap<String, Slot>,
    name: String,
    mutex: Arc<Mutex<()>>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        // The predicate runs under the shard write lock: when we are the last
        // reference the slot is removed atomically, otherwise the count just drops.
        self.entries
            .remove_if(&self.name, |_, slot| slot.refs.fetch_sub(1, AcqRel) == 1);
    }
}

/// Holds the mutex for one name; the lock is released when this guard is dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyedMutexGuard<'a> {
    _permit: OwnedMutexGuard<()>,
    _checkout: Checkout<'a>,
}
