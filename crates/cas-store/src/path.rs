use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::{StoreError, StoreResult};

/// Hex characters per directory level for content-addressed paths.
pub const DEFAULT_BLOCK_SIZE: usize = 5;

/// Hex-encoded SHA-1 digest of `data`.
///
/// This is the content-derived key a node uses for payloads it receives:
/// identical bytes always map to the same key.
pub fn content_key(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Location of one stored object relative to the store root.
///
/// The directory part is an ordered list of segments; the object file lives
/// inside the last one. `FullPath = PathName + "/" + FileName`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathKey {
    segments: Vec<String>,
    file_name: String,
}

impl PathKey {
    /// Create a path key from directory segments and a file name.
    pub fn new(segments: Vec<String>, file_name: impl Into<String>) -> Self {
        Self {
            segments,
            file_name: file_name.into(),
        }
    }

    /// Directory segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Directory part joined with `/`.
    pub fn path_name(&self) -> String {
        self.segments.join("/")
    }

    /// Name of the object file.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The outermost directory segment, if any.
    pub fn first_path_name(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Directory part and file name joined with `/`.
    pub fn full_path(&self) -> String {
        if self.segments.is_empty() {
            return self.file_name.clone();
        }
        format!("{}/{}", self.path_name(), self.file_name)
    }

    /// Relative directory as a native path.
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Relative object file path as a native path.
    pub fn file(&self) -> PathBuf {
        self.dir().join(&self.file_name)
    }

    /// Reject components that would escape the store root or collapse into
    /// their parent directory.
    pub(crate) fn validate(&self, key: &str) -> StoreResult<()> {
        let invalid = |reason: String| StoreError::InvalidKey {
            key: key.to_string(),
            reason,
        };
        for component in self.segments.iter().chain(std::iter::once(&self.file_name)) {
            if component.is_empty() {
                return Err(invalid("empty path component".into()));
            }
            if component == "." || component == ".." {
                return Err(invalid(format!("reserved path component {component:?}")));
            }
            if component.contains(['/', '\\', '\0']) {
                return Err(invalid(format!(
                    "path component {component:?} contains a separator"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

/// Maps an application key to its on-disk location.
///
/// Implementations must be pure: the same key always yields the same
/// `PathKey`, and they must not panic.
pub trait PathTransform: Send + Sync {
    fn transform(&self, key: &str) -> PathKey;
}

impl<F> PathTransform for F
where
    F: Fn(&str) -> PathKey + Send + Sync,
{
    fn transform(&self, key: &str) -> PathKey {
        self(key)
    }
}

/// Uses the key verbatim as both directory and file name.
///
/// Not collision safe, and keys containing separators are rejected by the
/// store.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransform;

impl PathTransform for IdentityTransform {
    fn transform(&self, key: &str) -> PathKey {
        PathKey::new(vec![key.to_string()], key)
    }
}

/// SHA-1 of the key, hex encoded and split into fixed-width directory
/// levels, with the full digest as the file name.
///
/// With the default block size the layout is
/// `{h[0:5]}/{h[5:10]}/.../{h[35:40]}/{h}`.
#[derive(Clone, Copy, Debug)]
pub struct ContentAddressedTransform {
    block_size: usize,
}

impl ContentAddressedTransform {
    /// Transform with `block_size` hex characters per directory level.
    ///
    /// A zero block size is treated as one. When the block size does not
    /// divide the digest length the trailing partial block becomes a shorter
    /// final segment.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Default for ContentAddressedTransform {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl PathTransform for ContentAddressedTransform {
    fn transform(&self, key: &str) -> PathKey {
        let hash = content_key(key.as_bytes());
        // Hex output is ASCII, so byte offsets are char boundaries.
        let segments = (0..hash.len())
            .step_by(self.block_size)
            .map(|from| hash[from..(from + self.block_size).min(hash.len())].to_string())
            .collect();
        PathKey::new(segments, hash)
    }
}
