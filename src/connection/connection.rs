use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use tracing::warn;

use crate::store::DeleteOptions;
use crate::store::KvApi;
use crate::store::KvResponse;
use crate::store::SetOptions;
use crate::store::WatchEvent;
use crate::tree::Tree;
use crate::tree::TreeOptions;
use crate::tree::TreeWatcher;
use crate::tree::TypeRegistry;
use crate::Error;
use crate::Result;
use crate::RetryPolicy;
use crate::Settings;
use crate::StoreError;

/// One session against the coordination store.
///
/// Every key is resolved under the configured root prefix, every networked
/// call goes through the bounded connection-failure retry, and every
/// successful write advances [`last_modified`](Connection::last_modified).
/// The connection also accounts for the watched trees it spawned: it cannot
/// be closed while any of them is still open.
pub struct Connection {
    store: Arc<dyn KvApi>,
    root: String,
    retry: RetryPolicy,
    last_modified: AtomicU64,
    trees: DashMap<u64, Arc<TreeWatcher>>,
    tree_seq: AtomicU64,
}

impl Connection {
    /// Open a session. Reads the root directory, creating it when absent,
    /// and seeds the last observed modification index from the response.
    pub async fn connect(store: Arc<dyn KvApi>, settings: Settings) -> Result<Arc<Self>> {
        let root = settings.connection.root;
        if !root.is_empty() && (!root.starts_with('/') || root.ends_with('/')) {
            return Err(StoreError::InvalidRequest(format!(
                "root must be empty or absolute without a trailing slash: {root:?}"
            ))
            .into());
        }
        let conn = Arc::new(Self {
            store,
            root,
            retry: settings.retry,
            last_modified: AtomicU64::new(0),
            trees: DashMap::new(),
            tree_seq: AtomicU64::new(1),
        });
        let res = match conn.read("", false).await {
            Err(e) if e.is_key_not_found() => {
                conn.set(
                    "",
                    None,
                    SetOptions {
                        dir: true,
                        ..Default::default()
                    },
                )
                .await?
            }
            other => other?,
        };
        conn.observe(res.store_index);
        debug!("connected under {:?} at index {}", conn.root, res.store_index);
        Ok(conn)
    }

    /// Resolve a caller key to its absolute form under the root prefix.
    pub(crate) fn ext_key(&self, key: &str) -> Result<String> {
        if key.is_empty() || key == "/" {
            return Ok(self.root.clone());
        }
        if !key.starts_with('/') || key.ends_with('/') || key.contains("//") {
            return Err(StoreError::InvalidRequest(format!("malformed key: {key:?}")).into());
        }
        Ok(format!("{}{}", self.root, key))
    }

    /// Highest modification index observed on this connection.
    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::SeqCst)
    }

    fn observe(&self, index: u64) {
        self.last_modified.fetch_max(index, Ordering::SeqCst);
    }

    /// Retry `op` on transient connection failure only, up to the configured
    /// bound. Everything else surfaces on the first attempt.
    pub(crate) async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Err(e) if e.is_connection_failed() && attempts < self.retry.max_retries => {
                    attempts += 1;
                    warn!(
                        "connection failed, retry {}/{}: {}",
                        attempts, self.retry.max_retries, e
                    );
                }
                other => return other,
            }
        }
    }

    /// Fetch the current value of a key.
    ///
    /// `KeyNotFound` propagates unmodified.
    pub async fn get(&self, key: &str) -> Result<KvResponse> {
        self.read(key, false).await
    }

    /// Fetch a key, optionally with its whole subtree.
    pub async fn read(&self, key: &str, recursive: bool) -> Result<KvResponse> {
        let key = self.ext_key(key)?;
        debug!("read {} recursive={}", key, recursive);
        let res = self.with_retry(|| self.store.get(&key, recursive)).await?;
        self.observe(res.store_index);
        Ok(res)
    }

    /// Create or update a key.
    ///
    /// Mutually exclusive conditions are rejected locally: `append` excludes
    /// the prev guards and `create == Some(false)`; `create == Some(true)`
    /// excludes the prev guards.
    pub async fn set(&self, key: &str, value: Option<String>, opts: SetOptions) -> Result<KvResponse> {
        if opts.append {
            if opts.prev_value.is_some() || opts.prev_index.is_some() || opts.create == Some(false)
            {
                return Err(StoreError::InvalidRequest(
                    "append excludes prev guards and create=false".into(),
                )
                .into());
            }
        } else if opts.create == Some(true)
            && (opts.prev_value.is_some() || opts.prev_index.is_some())
        {
            return Err(
                StoreError::InvalidRequest("create=true excludes prev guards".into()).into(),
            );
        }
        let key = self.ext_key(key)?;
        debug!("set {} = {:?} {:?}", key, value, opts);
        let res = self
            .with_retry(|| self.store.put(&key, value.clone(), opts.clone()))
            .await?;
        self.observe(res.node.modified_index);
        Ok(res)
    }

    /// Delete a key. A `prev_value`/`prev_index` mismatch surfaces as
    /// `PreconditionFailed`.
    pub async fn delete(&self, key: &str, opts: DeleteOptions) -> Result<KvResponse> {
        let key = self.ext_key(key)?;
        debug!("delete {} {:?}", key, opts);
        let res = self
            .with_retry(|| self.store.delete(&key, opts.clone()))
            .await?;
        self.observe(res.node.modified_index);
        Ok(res)
    }

    /// Long-poll one watch event. Used by the watcher's reader task so the
    /// re-opened polls get the same bounded retry as every other call.
    pub(crate) async fn watch_once(
        &self,
        ext_key: &str,
        wait_index: u64,
    ) -> Result<Option<WatchEvent>> {
        self.with_retry(|| self.store.watch_once(ext_key, wait_index, true))
            .await
    }

    /// Materialize the subtree at `key` and keep it live.
    ///
    /// The bootstrap is idempotent for `create: None`: read, and only on
    /// "not found" attempt the create, and only on "already exists" (the
    /// create race was lost) fall back to reading again — the store has no
    /// atomic create-if-absent for directories. Both racers end up attached
    /// to the same remote directory.
    ///
    /// Unless `opts.static_tree`, a [`TreeWatcher`] is spawned over the
    /// result and registered with this connection.
    pub async fn tree(
        self: &Arc<Self>,
        key: &str,
        registry: Arc<TypeRegistry>,
        opts: TreeOptions,
    ) -> Result<Tree> {
        let ext = self.ext_key(key)?;
        let res = match opts.create {
            Some(false) => self.read(key, true).await?,
            Some(true) => self.mkdir(key).await?,
            None => match self.read(key, true).await {
                Err(e) if e.is_key_not_found() => match self.mkdir(key).await {
                    // lost the create race: someone else made it first
                    Err(e) if e.is_key_already_exists() => self.read(key, true).await?,
                    other => other?,
                },
                other => other?,
            },
        };

        let tree = Tree::materialize(&res.node, key, &registry);
        let watcher = if opts.static_tree {
            None
        } else {
            Some(TreeWatcher::spawn(
                self,
                ext,
                res.store_index,
                Arc::downgrade(tree.root()),
                registry,
            ))
        };
        Ok(tree.with_watcher(watcher))
    }

    async fn mkdir(&self, key: &str) -> Result<KvResponse> {
        self.set(
            key,
            None,
            SetOptions {
                create: Some(true),
                dir: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Number of watched trees still registered.
    pub fn open_trees(&self) -> usize {
        self.trees.len()
    }

    /// Close the session. Fails while watched trees remain open; close them
    /// first so no watcher outlives its connection.
    pub fn close(&self) -> Result<()> {
        if !self.trees.is_empty() {
            return Err(Error::OpenTrees(self.trees.len()));
        }
        debug!("connection under {:?} closed", self.root);
        Ok(())
    }

    pub(crate) fn next_tree_id(&self) -> u64 {
        self.tree_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_tree(&self, id: u64, watcher: Arc<TreeWatcher>) {
        self.trees.insert(id, watcher);
    }

    pub(crate) fn deregister_tree(&self, id: u64) {
        self.trees.remove(&id);
    }
}
