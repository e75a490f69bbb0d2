//! Content-addressed file storage for the CAS network.
//!
//! Objects are plain files under a root directory. Where a key lands is
//! decided by a [`PathTransform`]:
//!
//! - [`ContentAddressedTransform`] -- SHA-1 of the key, hex encoded, split
//!   into fixed-width directory levels (`68044/29f74/.../6804429f...`)
//! - [`IdentityTransform`] -- the key itself, for debugging and tests
//!
//! # Design Rules
//!
//! 1. The path for a key is recomputed on every operation and never stored.
//! 2. Sharding bounds directory fan-out to 16^block_size entries per level.
//! 3. Deleting a key removes only its file and the directories it leaves
//!    empty; objects sharing a shard prefix are untouched.
//! 4. All I/O errors are returned to the caller, never retried.

pub mod error;
pub mod path;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use path::{
    content_key, ContentAddressedTransform, IdentityTransform, PathKey, PathTransform,
    DEFAULT_BLOCK_SIZE,
};
pub use store::{Store, StoreOptions, StoreStats, DEFAULT_ROOT_FOLDER_NAME};
