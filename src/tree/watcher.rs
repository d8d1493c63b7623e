use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

use crate::connection::Connection;
use crate::store::WatchEvent;
use crate::tree::build_node;
use crate::tree::MirrorNode;
use crate::tree::NodeKind;
use crate::tree::TypeRegistry;
use crate::Error;
use crate::Result;
use crate::StopReason;
use crate::WatchError;

/// Shared progress of one watcher, broadcast to `sync` waiters.
#[derive(Debug, Clone)]
pub(crate) struct WatchProgress {
    pub(crate) last_seen: u64,
    pub(crate) stopped: Option<StopReason>,
}

/// Keeps a materialized tree converged with the remote store.
///
/// Two tasks share an event channel. The reader long-polls the store from
/// `last_read + 1` so a reopened poll can never skip an index; an event older
/// than what was already read means the store replayed out of order and the
/// watcher stops rather than corrupt the mirror. The writer applies events
/// to the tree in arrival order and publishes `last_seen`, which is what
/// [`sync`](TreeWatcher::sync) waits on.
///
/// The watcher holds the root only weakly. When the owning [`Tree`] is
/// dropped the writer notices the dead upgrade and stops on its own.
///
/// [`Tree`]: crate::tree::Tree
pub struct TreeWatcher {
    id: u64,
    conn: Weak<Connection>,
    ext_key: String,
    last_read: Arc<AtomicU64>,
    progress: watch::Sender<WatchProgress>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TreeWatcher {
    pub(crate) fn spawn(
        conn: &Arc<Connection>,
        ext_key: String,
        start_index: u64,
        root: Weak<dyn MirrorNode>,
        registry: Arc<TypeRegistry>,
    ) -> Arc<Self> {
        let id = conn.next_tree_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(WatchProgress {
            last_seen: start_index,
            stopped: None,
        });
        let watcher = Arc::new(Self {
            id,
            conn: Arc::downgrade(conn),
            ext_key,
            last_read: Arc::new(AtomicU64::new(start_index)),
            progress,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.read_loop(tx).await }
        });
        let writer = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.write_loop(rx, root, registry).await }
        });
        watcher.tasks.lock().extend([reader, writer]);

        conn.register_tree(id, watcher.clone());
        watcher
    }

    /// Prefix this watcher covers, in absolute store keys.
    pub fn ext_key(&self) -> &str {
        &self.ext_key
    }

    /// Highest modification index the writer has applied.
    pub fn last_seen(&self) -> u64 {
        self.progress.borrow().last_seen
    }

    /// Whether the watcher is still converging the tree.
    pub fn running(&self) -> bool {
        self.progress.borrow().stopped.is_none()
    }

    /// Wait until the tree reflects every change up to `index`, or up to the
    /// connection's last observed modification when `index` is `None`.
    ///
    /// A watcher that stopped before catching up cannot make the tree
    /// current, so this fails with [`WatchError::Stopped`] even when the
    /// stop was a voluntary close.
    pub async fn sync(&self, index: Option<u64>) -> Result<()> {
        let target = match index {
            Some(index) => index,
            None => match self.conn.upgrade() {
                Some(conn) => conn.last_modified(),
                // the connection is gone, nothing newer can exist
                None => return Ok(()),
            },
        };
        let mut rx = self.progress.subscribe();
        let progress = rx
            .wait_for(|p| p.stopped.is_some() || p.last_seen >= target)
            .await;
        match progress {
            Ok(progress) => match &progress.stopped {
                Some(reason) => Err(WatchError::Stopped {
                    reason: reason.clone(),
                }
                .into()),
                None => Ok(()),
            },
            Err(_) => Err(WatchError::Stopped {
                reason: StopReason::Closed,
            }
            .into()),
        }
    }

    /// Stop both tasks, wait for them to finish and deregister from the
    /// connection.
    pub async fn close(&self) {
        self.stop(StopReason::Closed);
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("watch task for {:?} panicked: {e}", self.ext_key);
            }
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.deregister_tree(self.id);
        }
        debug!("watcher for {:?} closed", self.ext_key);
    }

    fn stop(&self, reason: StopReason) {
        self.progress.send_modify(|p| {
            if p.stopped.is_none() {
                p.stopped = Some(reason);
            }
        });
    }

    async fn read_loop(&self, tx: mpsc::UnboundedSender<WatchEvent>) {
        loop {
            let wait_index = self.last_read.load(Ordering::SeqCst) + 1;
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return,
                polled = self.poll_once(wait_index) => polled,
            };
            match polled {
                Ok(Some(event)) => {
                    if event.modified_index < wait_index {
                        error!(
                            "watch on {:?} went backwards: index {} after {}",
                            self.ext_key,
                            event.modified_index,
                            wait_index - 1
                        );
                        self.stop(StopReason::Failed(Arc::new(
                            WatchError::OutOfSequence {
                                last_read: wait_index - 1,
                                index: event.modified_index,
                            }
                            .into(),
                        )));
                        return;
                    }
                    self.last_read.store(event.modified_index, Ordering::SeqCst);
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                // the poll expired without an event, reopen it
                Ok(None) => continue,
                Err(e) => {
                    error!("watch on {:?} failed: {e}", self.ext_key);
                    self.stop(StopReason::Failed(Arc::new(e)));
                    return;
                }
            }
        }
    }

    async fn poll_once(&self, wait_index: u64) -> Result<Option<WatchEvent>> {
        let conn = self
            .conn
            .upgrade()
            .ok_or_else(|| Error::Fatal("connection dropped while watching".into()))?;
        conn.watch_once(&self.ext_key, wait_index).await
    }

    async fn write_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<WatchEvent>,
        root: Weak<dyn MirrorNode>,
        registry: Arc<TypeRegistry>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            let Some(root) = root.upgrade() else {
                debug!("tree for {:?} dropped, stopping watcher", self.ext_key);
                self.stop(StopReason::Closed);
                return;
            };
            let index = event.modified_index;
            self.apply(&root, &registry, event);
            // an event outside the prefix still advances progress, or sync
            // would stall on indexes this watcher never applies
            self.progress.send_modify(|p| {
                if index > p.last_seen {
                    p.last_seen = index;
                }
            });
        }
    }

    fn apply(&self, root: &Arc<dyn MirrorNode>, registry: &TypeRegistry, event: WatchEvent) {
        let Some(rel) = relative_key(&self.ext_key, &event.key) else {
            debug!("event outside {:?} skipped: {:?}", self.ext_key, event.key);
            return;
        };
        let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();

        if event.kind.is_removal() {
            if segments.is_empty() {
                root.mark_deleted(event.modified_index);
                return;
            }
            let mut node = root.clone();
            for segment in &segments[..segments.len() - 1] {
                match node.child(segment) {
                    Some(child) => node = child,
                    // never materialized here, nothing to remove
                    None => return,
                }
            }
            if let Some(last) = segments.last() {
                if let Some(removed) = node.remove_child(last) {
                    removed.mark_deleted(event.modified_index);
                }
            }
            return;
        }

        if segments.is_empty() {
            root.apply_update(event.value.as_deref(), event.modified_index);
            return;
        }

        let base = root.path().len();
        let mut abs: Vec<String> = root.path().to_vec();
        let mut node = root.clone();
        for (depth, segment) in segments.iter().enumerate() {
            abs.push(segment.to_string());
            let leaf = depth + 1 == segments.len();
            let kind = if leaf && !event.dir {
                NodeKind::Value
            } else {
                NodeKind::Directory
            };
            let mut make = || build_node(registry, &abs, base, kind);
            match node.child_or_insert_with(segment, &mut make) {
                Some(child) => node = child,
                None => {
                    debug!(
                        "value node shadows {:?}, skipping event at {:?}",
                        abs.join("/"),
                        event.key
                    );
                    return;
                }
            }
        }
        node.apply_update(event.value.as_deref(), event.modified_index);
    }
}

/// Part of `key` below `prefix`, or `None` for keys outside it. The watch
/// prefix matches on whole segments only.
fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    if prefix.is_empty() || prefix == "/" {
        return Some(key);
    }
    if key == prefix {
        return Some("");
    }
    key.strip_prefix(prefix).filter(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod relative_key_tests {
    use super::relative_key;

    #[test]
    fn test_relative_key() {
        assert_eq!(relative_key("/root", "/root/a/b"), Some("/a/b"));
        assert_eq!(relative_key("/root", "/root"), Some(""));
        assert_eq!(relative_key("/root", "/rooted/a"), None);
        assert_eq!(relative_key("/root", "/other"), None);
        assert_eq!(relative_key("", "/a"), Some("/a"));
        assert_eq!(relative_key("/", "/a"), Some("/a"));
    }
}
