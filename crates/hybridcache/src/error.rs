// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache operations.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Any error that can surface from a cache request.
///
/// Internal flush failures do not appear here: once a caller holds its reader, a
/// background flush that fails is logged and degrades the observability detail of
/// later requests rather than failing anyone.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request's cancellation token fired.
    #[error("cache request canceled")]
    Canceled,

    /// The artifact producer failed; the cache was not mutated.
    #[error("artifact producer failed")]
    Producer(#[source] BoxError),

    /// The metadata/eviction collaborator failed.
    #[error("cleanup manager operation failed")]
    Cleanup(#[source] BoxError),

    /// We are forwarding an error received from the filesystem.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a producer failure, preserving the cause unchanged.
    pub fn producer(cause: impl Into<BoxError>) -> Self {
        Self::Producer(cause.into())
    }

    /// Wraps a failure reported by the cleanup manager.
    pub fn cleanup(cause: impl Into<BoxError>) -> Self {
        Self::Cleanup(cause.into())
    }
}

/// A specialized `Result` for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
