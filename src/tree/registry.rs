use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::WILD_DEEP;
use crate::constants::WILD_ONE;
use crate::tree::NodeFactory;
use crate::tree::NodeKind;
use crate::RegistryError;
use crate::Result;

/// How specifically a registry node matched the looked-up path. Higher wins
/// when priorities tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Match {
    Deep = 0,
    One = 1,
    Literal = 2,
}

fn slot(kind: NodeKind) -> usize {
    match kind {
        NodeKind::Value => 0,
        NodeKind::Directory => 1,
    }
}

/// Pattern trie mapping tree-relative paths to node factories.
///
/// Patterns are slash-separated segments. A literal segment matches itself,
/// [`WILD_ONE`] (`*`) matches exactly one segment, and [`WILD_DEEP`] (`**`)
/// matches one or more. Each pattern holds up to two factories, one per
/// [`NodeKind`], so `/foo` can name both the directory and the values it
/// contains.
///
/// Registration happens before the registry is shared; lookup is read-only
/// and runs on the watcher's writer task.
#[derive(Default)]
pub struct TypeRegistry {
    children: HashMap<String, TypeRegistry>,
    types: [Option<Arc<dyn NodeFactory>>; 2],
    priority: i32,
    doc: Option<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` at `pattern` with default priority.
    pub fn register(&mut self, pattern: &str, factory: Arc<dyn NodeFactory>) -> Result<()> {
        self.register_with(pattern, factory, 0, None)
    }

    /// Register `factory` at `pattern`.
    ///
    /// `priority` breaks lookup conflicts between overlapping patterns; a
    /// higher value wins regardless of specificity. Registering a second
    /// factory of the same kind at the same pattern is an error.
    pub fn register_with(
        &mut self,
        pattern: &str,
        factory: Arc<dyn NodeFactory>,
        priority: i32,
        doc: Option<&str>,
    ) -> Result<()> {
        let node = self.entry(pattern)?;
        let slot = slot(factory.kind());
        if node.types[slot].is_some() {
            return Err(RegistryError::DuplicateRegistration {
                pattern: pattern.to_string(),
            }
            .into());
        }
        node.types[slot] = Some(factory);
        node.priority = priority;
        if let Some(doc) = doc {
            node.doc = Some(doc.to_string());
        }
        Ok(())
    }

    /// The registry node at `pattern`, created on demand. Useful for scoped
    /// registration of a whole pattern subtree.
    pub fn entry(&mut self, pattern: &str) -> Result<&mut TypeRegistry> {
        let trimmed = pattern.trim_matches('/');
        let mut node = self;
        if trimmed.is_empty() {
            return Ok(node);
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(RegistryError::EmptySegment {
                    pattern: pattern.to_string(),
                }
                .into());
            }
            node = node.children.entry(segment.to_string()).or_default();
        }
        Ok(node)
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The factory for a node of `kind` at the tree-relative `path`.
    ///
    /// All patterns able to reach `path` compete; the winner has the highest
    /// `(priority, specificity)` pair, with literal beating `*` beating `**`
    /// on equal priority. A registration that ties exactly keeps the earlier
    /// winner, so lookup order is deterministic.
    pub fn lookup(&self, path: &[&str], kind: NodeKind) -> Option<Arc<dyn NodeFactory>> {
        let mut frontier: Vec<(&TypeRegistry, Match)> = vec![(self, Match::Literal)];
        for segment in path {
            let mut next: Vec<(&TypeRegistry, Match)> = Vec::new();
            for (node, matched) in &frontier {
                if let Some(child) = node.children.get(*segment) {
                    next.push((child, Match::Literal));
                }
                if let Some(child) = node.children.get(WILD_ONE) {
                    next.push((child, Match::One));
                }
                if let Some(child) = node.children.get(WILD_DEEP) {
                    next.push((child, Match::Deep));
                }
                // a deep wildcard keeps consuming further segments
                if *matched == Match::Deep {
                    next.push((node, Match::Deep));
                }
            }
            if next.is_empty() {
                return None;
            }
            frontier = next;
        }

        let mut best: Option<(Arc<dyn NodeFactory>, (i32, Match))> = None;
        for (node, matched) in frontier {
            if let Some(factory) = &node.types[slot(kind)] {
                let rank = (node.priority, matched);
                let better = match &best {
                    Some((_, current)) => rank > *current,
                    None => true,
                };
                if better {
                    best = Some((factory.clone(), rank));
                }
            }
        }
        best.map(|(factory, _)| factory)
    }
}
