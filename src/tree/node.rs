use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Value,
}

/// In-memory representation of one remote node.
///
/// The watcher creates, updates and removes nodes only through this trait.
/// Richer node behavior plugs in through a [`NodeFactory`] registered in the
/// [`TypeRegistry`](crate::TypeRegistry); the stock implementations below
/// cover untyped use.
///
/// Mutation of a node is serialized by that node's own lock, never by a
/// tree-wide one, so readers of unrelated subtrees never contend with the
/// watcher.
pub trait MirrorNode: Send + Sync + 'static {
    /// Path segments relative to the connection root.
    fn path(&self) -> &[String];

    fn kind(&self) -> NodeKind;

    /// Index of the last change applied to this node.
    fn modified_index(&self) -> u64;

    /// Whether a delete event has been applied to this node.
    fn is_deleted(&self) -> bool;

    /// Existing child, without creating anything. `None` on value nodes and
    /// missing segments.
    fn child(&self, segment: &str) -> Option<Arc<dyn MirrorNode>>;

    /// Existing child, or the node produced by `make`, inserted under this
    /// node's own lock. `None` on value nodes.
    fn child_or_insert_with(
        &self,
        segment: &str,
        make: &mut dyn FnMut() -> Arc<dyn MirrorNode>,
    ) -> Option<Arc<dyn MirrorNode>>;

    /// Detach a child. `None` when it was already absent.
    fn remove_child(&self, segment: &str) -> Option<Arc<dyn MirrorNode>>;

    fn apply_update(&self, value: Option<&str>, index: u64);

    fn mark_deleted(&self, index: u64);

    fn as_any(&self) -> &dyn Any;
}

impl dyn MirrorNode {
    /// Downcast to a concrete node type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Builds nodes of one kind for the paths a pattern matched.
pub trait NodeFactory: Send + Sync {
    fn kind(&self) -> NodeKind;
    fn build(&self, path: Vec<String>) -> Arc<dyn MirrorNode>;
}

/// Stock directory node: a named map of children.
pub struct DirNode {
    path: Vec<String>,
    children: Mutex<HashMap<String, Arc<dyn MirrorNode>>>,
    modified: AtomicU64,
    deleted: AtomicBool,
}

impl DirNode {
    pub fn new(path: Vec<String>) -> Self {
        Self {
            path,
            children: Mutex::new(HashMap::new()),
            modified: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    pub fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl MirrorNode for DirNode {
    fn path(&self) -> &[String] {
        &self.path
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn modified_index(&self) -> u64 {
        self.modified.load(Ordering::SeqCst)
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn child(&self, segment: &str) -> Option<Arc<dyn MirrorNode>> {
        self.children.lock().get(segment).cloned()
    }

    fn child_or_insert_with(
        &self,
        segment: &str,
        make: &mut dyn FnMut() -> Arc<dyn MirrorNode>,
    ) -> Option<Arc<dyn MirrorNode>> {
        let mut children = self.children.lock();
        Some(
            children
                .entry(segment.to_string())
                .or_insert_with(|| make())
                .clone(),
        )
    }

    fn remove_child(&self, segment: &str) -> Option<Arc<dyn MirrorNode>> {
        self.children.lock().remove(segment)
    }

    fn apply_update(&self, _value: Option<&str>, index: u64) {
        self.modified.fetch_max(index, Ordering::SeqCst);
    }

    fn mark_deleted(&self, index: u64) {
        self.modified.fetch_max(index, Ordering::SeqCst);
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct ValueState {
    raw: Option<String>,
    modified: u64,
}

/// Stock value node holding the raw string payload.
pub struct ValueNode {
    path: Vec<String>,
    state: Mutex<ValueState>,
    deleted: AtomicBool,
}

impl ValueNode {
    pub fn new(path: Vec<String>) -> Self {
        Self {
            path,
            state: Mutex::new(ValueState::default()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.state.lock().raw.clone()
    }
}

impl MirrorNode for ValueNode {
    fn path(&self) -> &[String] {
        &self.path
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Value
    }

    fn modified_index(&self) -> u64 {
        self.state.lock().modified
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn child(&self, _segment: &str) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn child_or_insert_with(
        &self,
        _segment: &str,
        _make: &mut dyn FnMut() -> Arc<dyn MirrorNode>,
    ) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn remove_child(&self, _segment: &str) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn apply_update(&self, value: Option<&str>, index: u64) {
        let mut state = self.state.lock();
        state.raw = value.map(str::to_string);
        state.modified = state.modified.max(index);
    }

    fn mark_deleted(&self, index: u64) {
        let mut state = self.state.lock();
        state.modified = state.modified.max(index);
        drop(state);
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct TypedState<T> {
    raw: Option<String>,
    parsed: Option<T>,
    modified: u64,
}

impl<T> Default for TypedState<T> {
    fn default() -> Self {
        Self {
            raw: None,
            parsed: None,
            modified: 0,
        }
    }
}

/// Value node that parses its payload into `T`.
///
/// A payload that fails to parse is kept raw; the typed slot reads `None`
/// until the remote writes something parseable again.
pub struct TypedValueNode<T> {
    path: Vec<String>,
    state: Mutex<TypedState<T>>,
    deleted: AtomicBool,
}

impl<T: FromStr + Send + Sync + 'static> TypedValueNode<T> {
    pub fn new(path: Vec<String>) -> Self {
        Self {
            path,
            state: Mutex::new(TypedState::default()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.state.lock().raw.clone()
    }

    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().parsed.clone()
    }
}

impl<T: FromStr + Send + Sync + 'static> MirrorNode for TypedValueNode<T> {
    fn path(&self) -> &[String] {
        &self.path
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Value
    }

    fn modified_index(&self) -> u64 {
        self.state.lock().modified
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn child(&self, _segment: &str) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn child_or_insert_with(
        &self,
        _segment: &str,
        _make: &mut dyn FnMut() -> Arc<dyn MirrorNode>,
    ) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn remove_child(&self, _segment: &str) -> Option<Arc<dyn MirrorNode>> {
        None
    }

    fn apply_update(&self, value: Option<&str>, index: u64) {
        let parsed = value.and_then(|raw| match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("unparseable value at {:?}: {:?}", self.path.join("/"), raw);
                None
            }
        });
        let mut state = self.state.lock();
        state.raw = value.map(str::to_string);
        state.parsed = parsed;
        state.modified = state.modified.max(index);
    }

    fn mark_deleted(&self, index: u64) {
        let mut state = self.state.lock();
        state.modified = state.modified.max(index);
        drop(state);
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`DirNode`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DirNodeFactory;

impl NodeFactory for DirNodeFactory {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn build(&self, path: Vec<String>) -> Arc<dyn MirrorNode> {
        Arc::new(DirNode::new(path))
    }
}

/// Factory for [`ValueNode`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueNodeFactory;

impl NodeFactory for ValueNodeFactory {
    fn kind(&self) -> NodeKind {
        NodeKind::Value
    }

    fn build(&self, path: Vec<String>) -> Arc<dyn MirrorNode> {
        Arc::new(ValueNode::new(path))
    }
}

/// Factory for [`TypedValueNode<T>`].
pub struct TypedValueFactory<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedValueFactory<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedValueFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FromStr + Send + Sync + 'static> NodeFactory for TypedValueFactory<T> {
    fn kind(&self) -> NodeKind {
        NodeKind::Value
    }

    fn build(&self, path: Vec<String>) -> Arc<dyn MirrorNode> {
        Arc::new(TypedValueNode::<T>::new(path))
    }
}
