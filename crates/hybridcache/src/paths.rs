// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping from fingerprint keys to filesystem locations.

use std::fmt::Write as _;
use std::path::PathBuf;

/// The filesystem identity of one cache entry, derived from its fingerprint.
///
/// `string_key` names the entry in every per-key lock registry and in the write
/// queue; `physical_path` is where the artifact lives when cached;
/// `relative_path` is a stable display form for logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntryPaths {
    /// Stable textual rendering of the fingerprint, used for lock naming and
    /// queue indexing. Uniqueness of `string_key` must coincide with uniqueness
    /// of `physical_path`.
    pub string_key: String,
    /// Absolute path of the cached artifact.
    pub physical_path: PathBuf,
    /// Root-relative display form for logs.
    pub relative_path: String,
}

/// Derives filesystem locations from fingerprint keys.
///
/// Implementations must be pure: the same key always yields the same paths, and
/// two keys share a `string_key` exactly when they share a `physical_path`.
/// Lock names are compared verbatim downstream, so any canonicalization
/// (including case folding) is this trait's responsibility.
pub trait PathBuilder: Send + Sync + 'static {
    /// Derives the locations for one fingerprint key.
    fn derive(&self, key: &[u8]) -> CacheEntryPaths;
}

/// A [`PathBuilder`] that hex-encodes the fingerprint and fans entries out into
/// a fixed number of subfolder levels.
///
/// With the default two levels, the fingerprint `0xAB 0xCD 0x01 ...` maps to
/// `<root>/ab/cd/abcd01….bin`. The fan-out keeps directory sizes manageable for
/// caches holding millions of entries; fingerprints shorter than the fan-out
/// prefix are stored flat under the root.
///
/// # Examples
///
/// ```
/// use hybridcache::{HexPathBuilder, PathBuilder};
///
/// let paths = HexPathBuilder::new("/var/cache/derivatives");
/// let entry = paths.derive(&[0xab, 0xcd, 0x01, 0x02]);
/// assert_eq!(entry.string_key, "abcd0102");
/// assert_eq!(entry.relative_path, "ab/cd/abcd0102.bin");
/// ```
#[derive(Clone, Debug)]
pub struct HexPathBuilder {
    root: PathBuf,
    subfolder_levels: usize,
}

impl HexPathBuilder {
    const EXTENSION: &'static str = "bin";

    /// Creates a builder rooted at `root` with two fan-out levels.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subfolder_levels: 2,
        }
    }

    /// Overrides the number of fan-out levels (one byte of the fingerprint per
    /// level).
    #[must_use]
    pub fn with_subfolder_levels(mut self, levels: usize) -> Self {
        self.subfolder_levels = levels;
        self
    }
}

impl PathBuilder for HexPathBuilder {
    fn derive(&self, key: &[u8]) -> CacheEntryPaths {
        let mut hex = String::with_capacity(key.len() * 2);
        for byte in key {
            let _ = write!(hex, "{byte:02x}");
        }

        let mut physical_path = self.root.clone();
        let mut relative_path = String::with_capacity(hex.len() + self.subfolder_levels * 3 + 4);
        // Fan out only when the fingerprint is long enough to leave a filename.
        if hex.len() > self.subfolder_levels * 2 {
            for level in 0..self.subfolder_levels {
                let prefix = &hex[level * 2..level * 2 + 2];
                physical_path.push(prefix);
                relative_path.push_str(prefix);
                relative_path.push('/');
            }
        }
        let file_name = format!("{hex}.{}", Self::EXTENSION);
        physical_path.push(&file_name);
        relative_path.push_str(&file_name);

        CacheEntryPaths {
            string_key: hex,
            physical_path,
            relative_path,
        }
    }
}
