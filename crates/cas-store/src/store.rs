use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::path::{IdentityTransform, PathKey, PathTransform};

/// Root folder used when [`StoreOptions::root`] is empty.
pub const DEFAULT_ROOT_FOLDER_NAME: &str = "casnetwork";

/// Configuration for a [`Store`].
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Directory containing every stored object. Empty means
    /// [`DEFAULT_ROOT_FOLDER_NAME`].
    pub root: PathBuf,
    /// Key-to-path mapping. `None` means [`IdentityTransform`].
    pub path_transform: Option<Arc<dyn PathTransform>>,
}

impl StoreOptions {
    /// Options rooted at `root` using `transform`.
    pub fn new(root: impl Into<PathBuf>, transform: impl PathTransform + 'static) -> Self {
        Self {
            root: root.into(),
            path_transform: Some(Arc::new(transform)),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("root", &self.root)
            .field("custom_transform", &self.path_transform.is_some())
            .finish()
    }
}

/// Object count and size of a store's contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: u64,
    pub bytes: u64,
}

/// Filesystem-backed key/value store with sharded paths.
///
/// Every operation recomputes the key's [`PathKey`] through the configured
/// transform; nothing besides the object files is persisted. The store holds
/// no locks: concurrent writers to the same key race and the last one wins.
pub struct Store {
    root: PathBuf,
    transform: Arc<dyn PathTransform>,
}

impl Store {
    /// Create a store, filling in defaults for unset options.
    ///
    /// Nothing is created on disk until the first write.
    pub fn new(options: StoreOptions) -> Self {
        let root = if options.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT_FOLDER_NAME)
        } else {
            options.root
        };
        let transform = options
            .path_transform
            .unwrap_or_else(|| Arc::new(IdentityTransform));
        Self { root, transform }
    }

    /// The directory all objects live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to its validated location relative to the root.
    pub fn path_key(&self, key: &str) -> StoreResult<PathKey> {
        let path_key = self.transform.transform(key);
        path_key.validate(key)?;
        Ok(path_key)
    }

    /// Absolute (root-joined) path of the object file for `key`.
    pub fn object_path(&self, key: &str) -> StoreResult<PathBuf> {
        Ok(self.root.join(self.path_key(key)?.file()))
    }

    /// Stream everything from `reader` into the object for `key`.
    ///
    /// Missing directory levels are created and an existing object is
    /// truncated. A failed write is not rolled back and may leave a partial
    /// file behind. Returns the number of bytes written.
    pub fn write(&self, key: &str, mut reader: impl Read) -> StoreResult<u64> {
        let path_key = self.path_key(key)?;
        fs::create_dir_all(self.root.join(path_key.dir()))?;

        let path = self.root.join(path_key.file());
        let mut file = File::create(&path)?;
        let written = io::copy(&mut reader, &mut file)?;

        debug!(key, bytes = written, path = %path_key, "wrote object");
        Ok(written)
    }

    /// Open the object for `key` for streaming reads.
    pub fn read_stream(&self, key: &str) -> StoreResult<File> {
        let path = self.object_path(key)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io(e),
        })
    }

    /// Full contents of the object for `key`.
    pub fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
        let mut file = self.read_stream(key)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Delete the object for `key`. Returns `true` if it existed.
    ///
    /// Directories left empty by the removal are pruned bottom-up. Shard
    /// directories still holding other objects, and the root itself, are
    /// never removed.
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let path_key = self.path_key(key)?;
        let path = self.root.join(path_key.file());

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_dirs(&path_key);

        debug!(key, path = %path_key, "deleted object");
        Ok(true)
    }

    /// Whether an object is stored for `key`. Never fails: unreadable or
    /// invalid keys report `false`.
    pub fn exists(&self, key: &str) -> bool {
        self.object_path(key)
            .map(|path| fs::metadata(path).is_ok())
            .unwrap_or(false)
    }

    /// Remove the root directory and everything below it.
    pub fn clear(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(root = %self.root.display(), "cleared store");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Count objects and bytes under the root.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                stats.objects += 1;
                stats.bytes += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok(stats)
    }

    fn prune_empty_dirs(&self, path_key: &PathKey) {
        let mut dir = self.root.join(path_key.dir());
        while dir != self.root && dir.starts_with(&self.root) {
            // remove_dir only succeeds on empty directories.
            if let Err(e) = fs::remove_dir(&dir) {
                trace!(dir = %dir.display(), error = %e, "stopped pruning");
                break;
            }
            if !dir.pop() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("root", &self.root).finish()
    }
}
