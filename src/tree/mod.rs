//! Live in-memory mirror of a store subtree: typed nodes, the pattern
//! registry that picks their types, and the watcher that keeps them current.

mod node;
mod registry;
mod watcher;

pub use node::*;
pub use registry::*;
pub use watcher::*;


use std::sync::Arc;

use crate::store::KvNode;
use crate::Result;

/// Options for [`Connection::tree`](crate::Connection::tree).
///
/// `create` mirrors the store's create guard: `Some(true)` insists the
/// directory does not exist yet, `Some(false)` insists it does, and `None`
/// takes it either way. `static_tree` skips the watcher, leaving a plain
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    pub create: Option<bool>,
    pub static_tree: bool,
}

/// A materialized subtree, optionally kept live by a [`TreeWatcher`].
///
/// The tree owns the root node strongly and is the only thing that does;
/// dropping the tree is what lets the watcher's weak reference die.
pub struct Tree {
    root: Arc<dyn MirrorNode>,
    watcher: Option<Arc<TreeWatcher>>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root.path())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// Build the node hierarchy for a recursive listing rooted at `key`.
    pub(crate) fn materialize(listing: &KvNode, key: &str, registry: &TypeRegistry) -> Self {
        let path: Vec<String> = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let root = match registry.lookup(&[], NodeKind::Directory) {
            Some(factory) => factory.build(path),
            None => Arc::new(DirNode::new(path)) as Arc<dyn MirrorNode>,
        };
        root.apply_update(listing.value.as_deref(), listing.modified_index);
        populate(&root, listing, root.path().len(), registry);
        Self {
            root,
            watcher: None,
        }
    }

    pub(crate) fn with_watcher(mut self, watcher: Option<Arc<TreeWatcher>>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn root(&self) -> &Arc<dyn MirrorNode> {
        &self.root
    }

    pub fn watcher(&self) -> Option<&Arc<TreeWatcher>> {
        self.watcher.as_ref()
    }

    /// Wait until the mirror has caught up; see [`TreeWatcher::sync`].
    /// Succeeds trivially on a static tree.
    pub async fn sync(&self, index: Option<u64>) -> Result<()> {
        match &self.watcher {
            Some(watcher) => watcher.sync(index).await,
            None => Ok(()),
        }
    }

    /// Stop the watcher and release the tree.
    pub async fn close(self) {
        if let Some(watcher) = &self.watcher {
            watcher.close().await;
        }
    }
}

/// Instantiate a node for `path`, consulting the registry with the part of
/// the path below the tree root (`base` segments deep).
pub(crate) fn build_node(
    registry: &TypeRegistry,
    path: &[String],
    base: usize,
    kind: NodeKind,
) -> Arc<dyn MirrorNode> {
    let rel: Vec<&str> = path[base..].iter().map(String::as_str).collect();
    match registry.lookup(&rel, kind) {
        Some(factory) => factory.build(path.to_vec()),
        None => match kind {
            NodeKind::Directory => Arc::new(DirNode::new(path.to_vec())),
            NodeKind::Value => Arc::new(ValueNode::new(path.to_vec())),
        },
    }
}

/// Recursively attach the children of a listing under `parent`.
fn populate(parent: &Arc<dyn MirrorNode>, listing: &KvNode, base: usize, registry: &TypeRegistry) {
    for child in &listing.nodes {
        let Some(segment) = child.key.rsplit('/').next().filter(|s| !s.is_empty()) else {
            continue;
        };
        let mut path = parent.path().to_vec();
        path.push(segment.to_string());
        let kind = if child.dir {
            NodeKind::Directory
        } else {
            NodeKind::Value
        };
        let mut make = || build_node(registry, &path, base, kind);
        if let Some(node) = parent.child_or_insert_with(segment, &mut make) {
            node.apply_update(child.value.as_deref(), child.modified_index);
            if child.dir {
                populate(&node, child, base, registry);
            }
        }
    }
}
