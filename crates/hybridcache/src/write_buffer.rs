// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory artifacts pending their flush to disk.

use std::io::Cursor;
use std::time::Instant;

use bytes::Bytes;

/// The product of one producer invocation: the artifact bytes plus an opaque
/// content-type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    /// The immutable artifact bytes.
    pub bytes: Bytes,
    /// Opaque short content-type string, e.g. `image/webp`.
    pub content_type: Option<String>,
}

impl Artifact {
    /// Creates an artifact from bytes and an optional content-type.
    #[must_use]
    pub fn new(bytes: Bytes, content_type: Option<String>) -> Self {
        Self { bytes, content_type }
    }
}

/// One pending artifact: immutable bytes awaiting a disk flush.
///
/// A `WriteBuffer` never mutates after construction. [`reader`](Self::reader)
/// hands out independent cursor views over the shared bytes, so any number of
/// concurrent readers can stream the artifact while the flush proceeds; neither
/// side blocks the other.
#[derive(Debug)]
pub struct WriteBuffer {
    string_key: String,
    bytes: Bytes,
    content_type: Option<String>,
    created_at: Instant,
}

impl WriteBuffer {
    /// Wraps a produced artifact for queuing under `string_key`.
    #[must_use]
    pub fn new(string_key: impl Into<String>, artifact: Artifact) -> Self {
        Self {
            string_key: string_key.into(),
            bytes: artifact.bytes,
            content_type: artifact.content_type,
            created_at: Instant::now(),
        }
    }

    /// The queue/lock key this buffer is filed under.
    #[must_use]
    pub fn string_key(&self) -> &str {
        &self.string_key
    }

    /// The artifact's content-type, if the producer reported one.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The artifact length in bytes. Buffer overhead is not counted.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// When this buffer was constructed.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns a fresh read-only view of the bytes with its own cursor.
    #[must_use]
    pub fn reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.bytes.clone())
    }
}
