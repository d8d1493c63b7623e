use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::DeleteOptions;
use super::EventKind;
use super::KvApi;
use super::KvNode;
use super::KvResponse;
use super::SetOptions;
use super::WatchEvent;
use crate::Result;
use crate::StoreError;

/// In-memory reference backend with coordination-store semantics: a global
/// monotonically increasing index, implicit parent-directory creation,
/// conditional writes, and an index-addressable change log so watchers can
/// resume from any index without gaps.
///
/// Intended for embedding and tests. It understands `ttl` on writes but does
/// not run an expiry clock.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    changed: watch::Sender<u64>,
}

struct StoreInner {
    root: MemNode,
    index: u64,
    log: Vec<WatchEvent>,
}

#[derive(Debug, Clone)]
struct MemNode {
    value: Option<String>,
    dir: bool,
    children: BTreeMap<String, MemNode>,
    modified_index: u64,
    created_index: u64,
}

impl MemNode {
    fn new_dir(index: u64) -> Self {
        Self {
            value: None,
            dir: true,
            children: BTreeMap::new(),
            modified_index: index,
            created_index: index,
        }
    }

    fn new_value(value: Option<String>, index: u64) -> Self {
        Self {
            value,
            dir: false,
            children: BTreeMap::new(),
            modified_index: index,
            created_index: index,
        }
    }

    fn to_kv_node(&self, key: &str, recursive: bool) -> KvNode {
        let nodes = if self.dir {
            self.children
                .iter()
                .map(|(name, child)| {
                    let child_key = if key == "/" {
                        format!("/{name}")
                    } else {
                        format!("{key}/{name}")
                    };
                    if recursive {
                        child.to_kv_node(&child_key, true)
                    } else {
                        child.shallow(&child_key)
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        KvNode {
            key: key.to_string(),
            value: self.value.clone(),
            dir: self.dir,
            modified_index: self.modified_index,
            created_index: self.created_index,
            nodes,
        }
    }

    fn shallow(&self, key: &str) -> KvNode {
        KvNode {
            key: key.to_string(),
            value: self.value.clone(),
            dir: self.dir,
            modified_index: self.modified_index,
            created_index: self.created_index,
            nodes: Vec::new(),
        }
    }
}

fn split_key(key: &str) -> Vec<&str> {
    key.split('/').filter(|s| !s.is_empty()).collect()
}

fn join_key(segs: &[&str]) -> String {
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

fn under(key: &str, prefix: &str, recursive: bool) -> bool {
    if key == prefix {
        return true;
    }
    if !recursive {
        return false;
    }
    if prefix == "/" {
        return true;
    }
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Walk to the node at `segs`, creating missing directories with index
/// `index`. Fails when a non-directory blocks the path.
fn ensure_dirs<'a>(root: &'a mut MemNode, segs: &[&str], index: u64) -> Result<&'a mut MemNode> {
    let mut node = root;
    for (depth, seg) in segs.iter().enumerate() {
        let child = node
            .children
            .entry(seg.to_string())
            .or_insert_with(|| MemNode::new_dir(index));
        if !child.dir {
            return Err(StoreError::NotDirectory(join_key(&segs[..=depth])).into());
        }
        node = child;
    }
    Ok(node)
}

impl StoreInner {
    /// Read-only walk; `Ok(None)` when the key is absent, an error when a
    /// non-directory blocks the path.
    fn peek_node(&self, segs: &[&str]) -> Result<Option<&MemNode>> {
        let mut node = &self.root;
        for (depth, seg) in segs.iter().enumerate() {
            if !node.dir {
                return Err(StoreError::NotDirectory(join_key(&segs[..depth])).into());
            }
            match node.children.get(*seg) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    fn get(&self, key: &str, recursive: bool) -> Result<KvResponse> {
        let segs = split_key(key);
        let node = self
            .peek_node(&segs)?
            .ok_or_else(|| StoreError::KeyNotFound(join_key(&segs)))?;
        Ok(KvResponse {
            action: EventKind::Get,
            node: node.to_kv_node(&join_key(&segs), recursive),
            store_index: self.index,
        })
    }

    fn put(
        &mut self,
        key: &str,
        value: Option<String>,
        opts: &SetOptions,
    ) -> Result<(KvResponse, WatchEvent)> {
        let segs = split_key(key);
        if opts.dir && (opts.prev_value.is_some() || opts.prev_index.is_some()) {
            return Err(
                StoreError::InvalidRequest("directory writes take no prev guards".into()).into(),
            );
        }

        if opts.append {
            return self.append(&segs, value);
        }
        if segs.is_empty() {
            return Err(StoreError::InvalidRequest("cannot write the root key".into()).into());
        }

        let existing = self
            .peek_node(&segs)?
            .map(|n| (n.dir, n.value.clone(), n.modified_index, n.created_index));
        let full_key = join_key(&segs);

        if opts.dir {
            if existing.is_some() {
                return Err(StoreError::KeyAlreadyExists(full_key).into());
            }
        } else {
            match &existing {
                Some((true, _, _, _)) => {
                    return Err(StoreError::NotDirectory(full_key).into());
                }
                Some(_) if opts.create == Some(true) => {
                    return Err(StoreError::KeyAlreadyExists(full_key).into());
                }
                None if opts.create == Some(false)
                    || opts.prev_value.is_some()
                    || opts.prev_index.is_some() =>
                {
                    return Err(StoreError::KeyNotFound(full_key).into());
                }
                Some((_, current, modified, _)) => {
                    if let Some(prev) = &opts.prev_value {
                        if current.as_deref() != Some(prev.as_str()) {
                            return Err(StoreError::PreconditionFailed {
                                key: full_key,
                                reason: format!(
                                    "expected value {:?}, found {:?}",
                                    prev, current
                                ),
                            }
                            .into());
                        }
                    }
                    if let Some(prev) = opts.prev_index {
                        if *modified != prev {
                            return Err(StoreError::PreconditionFailed {
                                key: full_key,
                                reason: format!("expected index {}, found {}", prev, modified),
                            }
                            .into());
                        }
                    }
                }
                None => {}
            }
        }

        self.index += 1;
        let index = self.index;
        let parent = ensure_dirs(&mut self.root, &segs[..segs.len() - 1], index)?;
        let created = existing
            .as_ref()
            .map(|(_, _, _, created)| *created)
            .unwrap_or(index);
        let mut node = if opts.dir {
            MemNode::new_dir(index)
        } else {
            MemNode::new_value(value, index)
        };
        node.created_index = created;
        parent
            .children
            .insert(segs[segs.len() - 1].to_string(), node.clone());

        let kind = if opts.dir || opts.create == Some(true) {
            EventKind::Create
        } else if opts.prev_value.is_some() || opts.prev_index.is_some() {
            EventKind::CompareAndSwap
        } else if opts.create == Some(false) {
            EventKind::Update
        } else {
            EventKind::Set
        };
        Ok(self.commit(kind, &full_key, &node))
    }

    /// In-order insert: the new child key is derived from the write index, so
    /// concurrent appends never collide and sort in creation order.
    fn append(&mut self, segs: &[&str], value: Option<String>) -> Result<(KvResponse, WatchEvent)> {
        if let Some(node) = self.peek_node(segs)? {
            if !node.dir {
                return Err(StoreError::NotDirectory(join_key(segs)).into());
            }
        }
        self.index += 1;
        let index = self.index;
        let parent = ensure_dirs(&mut self.root, segs, index)?;
        let name = format!("{index:020}");
        let node = MemNode::new_value(value, index);
        parent.children.insert(name.clone(), node.clone());
        let full_key = if segs.is_empty() {
            format!("/{name}")
        } else {
            format!("{}/{}", join_key(segs), name)
        };
        Ok(self.commit(EventKind::Create, &full_key, &node))
    }

    fn delete(&mut self, key: &str, opts: &DeleteOptions) -> Result<(KvResponse, WatchEvent)> {
        let segs = split_key(key);
        if segs.is_empty() {
            return Err(StoreError::InvalidRequest("cannot delete the root key".into()).into());
        }
        let full_key = join_key(&segs);
        let Some(node) = self.peek_node(&segs)? else {
            return Err(StoreError::KeyNotFound(full_key).into());
        };
        if node.dir {
            if opts.prev_value.is_some() || opts.prev_index.is_some() {
                return Err(StoreError::InvalidRequest(
                    "directory deletes take no prev guards".into(),
                )
                .into());
            }
            if !opts.recursive && !node.children.is_empty() {
                return Err(
                    StoreError::InvalidRequest(format!("directory not empty: {full_key}")).into(),
                );
            }
        } else {
            if let Some(prev) = &opts.prev_value {
                if node.value.as_deref() != Some(prev.as_str()) {
                    return Err(StoreError::PreconditionFailed {
                        key: full_key,
                        reason: format!("expected value {:?}, found {:?}", prev, node.value),
                    }
                    .into());
                }
            }
            if let Some(prev) = opts.prev_index {
                if node.modified_index != prev {
                    return Err(StoreError::PreconditionFailed {
                        key: full_key,
                        reason: format!("expected index {}, found {}", prev, node.modified_index),
                    }
                    .into());
                }
            }
        }

        self.index += 1;
        let index = self.index;
        let mut parent = &mut self.root;
        for seg in &segs[..segs.len() - 1] {
            match parent.children.get_mut(*seg) {
                Some(child) => parent = child,
                None => return Err(StoreError::KeyNotFound(full_key).into()),
            }
        }
        let Some(mut removed) = parent.children.remove(segs[segs.len() - 1]) else {
            return Err(StoreError::KeyNotFound(full_key).into());
        };
        removed.value = None;
        removed.modified_index = index;
        let kind = if opts.prev_value.is_some() || opts.prev_index.is_some() {
            EventKind::CompareAndDelete
        } else {
            EventKind::Delete
        };
        Ok(self.commit(kind, &full_key, &removed))
    }

    fn commit(&mut self, kind: EventKind, key: &str, node: &MemNode) -> (KvResponse, WatchEvent) {
        let event = WatchEvent {
            key: key.to_string(),
            kind,
            value: node.value.clone(),
            dir: node.dir,
            modified_index: node.modified_index,
        };
        self.log.push(event.clone());
        let response = KvResponse {
            action: kind,
            node: node.shallow(key),
            store_index: self.index,
        };
        (response, event)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StoreInner {
                root: MemNode::new_dir(0),
                index: 0,
                log: Vec::new(),
            }),
            changed,
        }
    }

    /// Current global modification index.
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvApi for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<KvResponse> {
        self.inner.lock().get(key, recursive)
    }

    async fn put(&self, key: &str, value: Option<String>, opts: SetOptions) -> Result<KvResponse> {
        let (response, event) = self.inner.lock().put(key, value, &opts)?;
        debug!("put {} -> index {}", event.key, event.modified_index);
        self.changed.send_replace(event.modified_index);
        Ok(response)
    }

    async fn delete(&self, key: &str, opts: DeleteOptions) -> Result<KvResponse> {
        let (response, event) = self.inner.lock().delete(key, &opts)?;
        debug!("delete {} -> index {}", event.key, event.modified_index);
        self.changed.send_replace(event.modified_index);
        Ok(response)
    }

    async fn watch_once(
        &self,
        key: &str,
        wait_index: u64,
        recursive: bool,
    ) -> Result<Option<WatchEvent>> {
        let prefix = join_key(&split_key(key));
        let mut rx = self.changed.subscribe();
        loop {
            {
                let inner = self.inner.lock();
                // Linear scan; fine for a reference backend.
                if let Some(event) = inner
                    .log
                    .iter()
                    .find(|e| e.modified_index >= wait_index && under(&e.key, &prefix, recursive))
                {
                    return Ok(Some(event.clone()));
                }
            }
            if rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }
}
