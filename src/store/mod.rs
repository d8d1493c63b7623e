//! Boundary to the remote coordination store.
//!
//! The wire protocol itself lives behind [`KvApi`]; everything above it only
//! assumes etcd-shaped semantics: a global monotonically increasing
//! modification index, conditional writes, and an index-based long-poll watch
//! that yields one event per poll. [`MemoryStore`] is the in-process reference
//! implementation used for embedding and tests.

mod memory;
mod types;

pub use memory::*;
pub use types::*;

#[cfg(test)]
mod memory_test;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvApi: Send + Sync + 'static {
    /// Fetch a key. With `recursive`, include the whole subtree; otherwise a
    /// directory lists only its direct children.
    ///
    /// # Errors
    /// - [`crate::StoreError::KeyNotFound`] when the key does not exist
    /// - [`crate::StoreError::ConnectionFailed`] on transport failure
    async fn get(&self, key: &str, recursive: bool) -> Result<KvResponse>;

    /// Create or update a key, subject to the conditions in `opts`.
    ///
    /// # Errors
    /// - [`crate::StoreError::KeyAlreadyExists`] when `create == Some(true)` and the key exists
    /// - [`crate::StoreError::KeyNotFound`] when `create == Some(false)` and the key is absent
    /// - [`crate::StoreError::PreconditionFailed`] on a `prev_value`/`prev_index` mismatch
    /// - [`crate::StoreError::NotDirectory`] when a non-directory blocks the path
    async fn put(&self, key: &str, value: Option<String>, opts: SetOptions) -> Result<KvResponse>;

    /// Delete a key, subject to the conditions in `opts`.
    async fn delete(&self, key: &str, opts: DeleteOptions) -> Result<KvResponse>;

    /// Long-poll the first change with index `>= wait_index` under `key`.
    ///
    /// `Ok(None)` means the server ended the poll without delivering an
    /// event; callers re-open at the same index, which is what makes watch
    /// resumption gap-free and duplicate-free.
    async fn watch_once(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
    ) -> Result<Option<WatchEvent>>;
}
