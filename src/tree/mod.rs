//! The virtualized tree engine.
//!
//! A `Tree` owns every node in a per-instance arena and maintains, for the
//! branch owners along each ancestor chain, a depth-first "flattened branch"
//! array of visible descendant ids. Structural mutations (expand, collapse,
//! insert, unlink, move, reload) splice those arrays in place, so the cost of
//! an update is bounded by the affected subtree rather than the whole tree.
//!
//! Children are resolved lazily through a host-supplied [`TreeResolver`];
//! every mutation is announced synchronously through the tree's watcher.

pub mod node;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, TreeError};
use crate::event::{
    MetadataChange, MetadataChangeType, TreeEvent, TreeWatcher, WatchEvent,
};
use node::{ExpansionState, NodeId, NodeItem, NodeKind, TreeNode};

/// Context handed to a resolver for one children-resolution call.
///
/// A snapshot of the parent node at call time; the tree itself is not
/// reachable from here, so resolvers cannot observe in-flight mutations.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub id: NodeId,
    /// Absolute tree path (`/<root-name>/...`).
    pub path: String,
    /// Path relative to the tree root; empty for the root itself.
    pub relative_path: String,
    pub depth: usize,
    pub metadata: HashMap<String, Value>,
}

/// Host contract: lazy children resolution plus an optional sibling order.
#[async_trait]
pub trait TreeResolver: Send + Sync {
    /// Resolve the children of `parent`. `Ok(None)` is treated as an empty
    /// list. An `Err` never surfaces to tree callers: the node degrades to
    /// an empty, valid child list (retries are the resolver's business).
    async fn resolve_children(&self, parent: &ResolveContext) -> Result<Option<Vec<NodeItem>>>;

    /// Sibling ordering; defaults to composites-before-leaves, then name.
    fn compare(&self, a: &TreeNode, b: &TreeNode) -> Ordering {
        default_node_order(a, b)
    }
}

/// Default sibling order: composite nodes sort before leaves, ties break
/// lexically by name.
pub fn default_node_order(a: &TreeNode, b: &TreeNode) -> Ordering {
    match (a.kind(), b.kind()) {
        (NodeKind::Composite, NodeKind::Leaf) => Ordering::Less,
        (NodeKind::Leaf, NodeKind::Composite) => Ordering::Greater,
        _ => a.name().cmp(b.name()),
    }
}

/// The tree engine. See the module docs for the ownership model.
pub struct Tree {
    resolver: Arc<dyn TreeResolver>,
    nodes: HashMap<NodeId, TreeNode>,
    /// Live path index; entries are removed on dispose.
    path_index: HashMap<String, NodeId>,
    /// Persistent path → id cache so a reloaded child at the same path keeps
    /// its previous id. Survives disposal on purpose.
    id_by_path: HashMap<String, NodeId>,
    next_id: u64,
    root: NodeId,
    watcher: TreeWatcher,
    refresh_pending: Option<Vec<String>>,
    refresh_in_flight: bool,
}

impl Tree {
    /// Create a tree whose root is named `root_<id>`.
    pub fn new(resolver: Arc<dyn TreeResolver>) -> Self {
        Self::build(resolver, None)
    }

    /// Create a tree with an explicit root name (useful when tree paths
    /// mirror an external namespace, e.g. a directory).
    pub fn named(resolver: Arc<dyn TreeResolver>, root_name: &str) -> Self {
        Self::build(resolver, Some(root_name))
    }

    fn build(resolver: Arc<dyn TreeResolver>, root_name: Option<&str>) -> Self {
        let root_id = NodeId(0);
        let name = root_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("root_{}", root_id.0));
        let root = TreeNode::new(root_id, NodeKind::Composite, None, &name, HashMap::new());
        let mut nodes = HashMap::new();
        let mut path_index = HashMap::new();
        let mut id_by_path = HashMap::new();
        path_index.insert(root.path().to_string(), root_id);
        id_by_path.insert(root.path().to_string(), root_id);
        nodes.insert(root_id, root);
        Self {
            resolver,
            nodes,
            path_index,
            id_by_path,
            next_id: 1,
            root: root_id,
            watcher: TreeWatcher::new(),
            refresh_pending: None,
            refresh_in_flight: false,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn node_by_path(&self, path: &str) -> Option<&TreeNode> {
        self.path_index
            .get(&self.absolute_path(path))
            .and_then(|id| self.nodes.get(id))
    }

    /// Total visible row count of the surface, for virtualization.
    pub fn branch_size(&self) -> usize {
        self.nodes.get(&self.root).map_or(0, TreeNode::branch_size)
    }

    /// Node occupying surface row `index`, if any.
    pub fn node_at_index(&self, index: usize) -> Option<&TreeNode> {
        let id = *self
            .nodes
            .get(&self.root)?
            .flattened_branch()?
            .get(index)?;
        self.nodes.get(&id)
    }

    /// Surface row of the node with id `id`, if it is currently visible.
    pub fn index_of_id(&self, id: NodeId) -> Option<usize> {
        self.nodes
            .get(&self.root)?
            .flattened_branch()?
            .iter()
            .position(|&n| n == id)
    }

    pub fn index_of_path(&self, path: &str) -> Option<usize> {
        let id = *self.path_index.get(&self.absolute_path(path))?;
        self.index_of_id(id)
    }

    /// Whether a node is reachable through the current flattened surface
    /// (i.e. not hidden beneath a collapsed ancestor). Independent of
    /// scrolling.
    pub fn is_item_visible_at_surface(&self, id: NodeId) -> bool {
        if id == self.root {
            return true;
        }
        self.nodes
            .get(&self.root)
            .and_then(TreeNode::flattened_branch)
            .is_some_and(|flat| flat.contains(&id))
    }

    /// Path relative to the tree root (`""` for the root).
    pub fn relative_path_of(&self, id: NodeId) -> Option<String> {
        let node = self.nodes.get(&id)?;
        let root_path = self.nodes.get(&self.root)?.path();
        Some(
            node.path()
                .strip_prefix(root_path)
                .unwrap_or(node.path())
                .trim_start_matches('/')
                .to_string(),
        )
    }

    /// Subscribe to this tree's structural events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TreeEvent> {
        self.watcher.subscribe()
    }

    fn absolute_path(&self, path: &str) -> String {
        let root_path = self
            .nodes
            .get(&self.root)
            .map(|r| r.path().to_string())
            .unwrap_or_default();
        if path.starts_with(&root_path) {
            path.to_string()
        } else {
            let rel = path.trim_start_matches('/');
            if rel.is_empty() {
                root_path
            } else {
                format!("{root_path}/{rel}")
            }
        }
    }

    // ── Loading and expansion ───────────────────────────────────────────────

    /// Ensure a composite node's children are loaded. Resolves immediately
    /// when already loaded; collapsed nodes are left untouched (their load
    /// happens on expansion).
    pub async fn ensure_loaded(&mut self, id: NodeId) -> Result<()> {
        let node = self.expect_node(id)?;
        if !node.is_composite() {
            return Err(TreeError::NotComposite(node.path().to_string()));
        }
        if node.children().is_some() {
            return Ok(());
        }
        self.hard_reload_children(id, false).await?;
        Ok(())
    }

    /// Expand a composite node. With `ensure_visible`, collapsed ancestors
    /// are expanded first so the node ends up on the surface. `quiet`
    /// suppresses the surface-update broadcast (expansion-state events still
    /// fire).
    pub async fn set_expanded(
        &mut self,
        id: NodeId,
        ensure_visible: bool,
        quiet: bool,
    ) -> Result<()> {
        let node = self.expect_node(id)?;
        if !node.is_composite() {
            return Err(TreeError::NotComposite(node.path().to_string()));
        }
        if node.is_root() || node.is_expanded() {
            return Ok(());
        }
        if ensure_visible {
            let mut chain = Vec::new();
            let mut cur = node.parent();
            while let Some(pid) = cur {
                let p = self.expect_node(pid)?;
                if !p.is_root() {
                    chain.push(pid);
                }
                cur = p.parent();
            }
            // Root-side ancestors first.
            for ancestor in chain.into_iter().rev() {
                self.expand_node(ancestor, true).await?;
            }
        }
        self.expand_node(id, quiet).await
    }

    /// Collapse a composite node. The root cannot collapse; a collapse that
    /// lands while children are still loading abandons the pending expand.
    pub fn set_collapsed(&mut self, id: NodeId, quiet: bool) -> Result<()> {
        let node = self.expect_node(id)?;
        if node.is_root() {
            return Ok(());
        }
        match node.expansion() {
            ExpansionState::Collapsed => Ok(()),
            ExpansionState::Loading => {
                // The racing expand re-checks this state after its await and
                // gives up; nothing was spliced yet, so nothing to shrink.
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.expansion = ExpansionState::Collapsed;
                }
                Ok(())
            }
            ExpansionState::Expanded => {
                let visible = self.is_item_visible_at_surface(id);
                self.watcher.notify(TreeEvent::WillChangeExpansionState {
                    id,
                    expanded: false,
                    visible_at_surface: visible,
                });
                let has_children = self.nodes.get(&id).is_some_and(|n| n.children().is_some());
                if has_children {
                    self.shrink_branch(id, quiet);
                }
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.expansion = ExpansionState::Collapsed;
                }
                self.watcher.notify(TreeEvent::DidChangeExpansionState {
                    id,
                    expanded: false,
                    visible_at_surface: visible,
                });
                Ok(())
            }
        }
    }

    /// Single-node expansion: load if needed, then merge the branch upward.
    async fn expand_node(&mut self, id: NodeId, quiet: bool) -> Result<()> {
        let node = self.expect_node(id)?;
        if node.is_root() || node.is_expanded() {
            return Ok(());
        }
        if node.expansion() == ExpansionState::Loading {
            return Ok(());
        }
        if node.children().is_none() {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.expansion = ExpansionState::Loading;
            }
            let loaded = self.hard_reload_children(id, quiet).await?;
            // A collapse may have raced in while the resolver ran; if so the
            // expand is abandoned here.
            if !loaded
                || self
                    .nodes
                    .get(&id)
                    .map_or(true, |n| n.expansion() != ExpansionState::Loading)
            {
                return Ok(());
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.expansion = ExpansionState::Expanded;
        }
        let visible = self.is_item_visible_at_surface(id);
        self.watcher.notify(TreeEvent::WillChangeExpansionState {
            id,
            expanded: true,
            visible_at_surface: visible,
        });
        self.expand_branch(id, quiet);
        self.watcher.notify(TreeEvent::DidChangeExpansionState {
            id,
            expanded: true,
            visible_at_surface: visible,
        });
        Ok(())
    }

    /// Reload a node's children from the resolver, rebuilding its own
    /// flattened array from scratch. Returns `false` when the load was
    /// abandoned (node gone or collapsed in the interim).
    async fn hard_reload_children(&mut self, id: NodeId, quiet: bool) -> Result<bool> {
        let ctx = match self.resolve_context(id) {
            Some(ctx) => ctx,
            None => return Ok(false),
        };
        self.watcher.notify(TreeEvent::WillResolveChildren { id });
        let resolver = Arc::clone(&self.resolver);
        let resolved = resolver.resolve_children(&ctx).await;
        self.watcher.notify(TreeEvent::DidResolveChildren { id });

        let items = match resolved {
            Ok(Some(items)) => items,
            Ok(None) => Vec::new(),
            Err(e) => {
                // Degrade to an empty but valid child list; the caller never
                // sees the failure.
                warn!(path = %ctx.path, error = %e, "child resolution failed, using empty list");
                Vec::new()
            }
        };

        let Some(node) = self.nodes.get(&id) else {
            return Ok(false);
        };
        if node.expansion() == ExpansionState::Collapsed {
            return Ok(false);
        }

        // An expanded node being reloaded first takes its span back from the
        // ancestor owner; the root already owns its array.
        let had_children = node.children().is_some();
        if had_children {
            self.shrink_branch(id, quiet);
            let old = self
                .nodes
                .get_mut(&id)
                .and_then(|n| n.children.take())
                .unwrap_or_default();
            for child in old {
                self.dispose_subtree(child);
            }
        }

        let mut ids = Vec::with_capacity(items.len());
        for item in &items {
            ids.push(self.materialize(id, item));
        }
        self.sort_ids(&mut ids);

        if let Some(n) = self.nodes.get_mut(&id) {
            n.children = Some(ids.clone());
            n.branch_size = ids.len();
            n.flattened_branch = Some(ids);
        }
        if id == self.root && !quiet {
            self.watcher.notify(TreeEvent::BranchDidUpdate);
        }
        Ok(true)
    }

    // ── Branch ownership transfer ───────────────────────────────────────────

    /// Merge `branch`'s own flattened array into the nearest ancestor owner,
    /// incrementing branch sizes along the way and releasing ownership.
    fn expand_branch(&mut self, branch: NodeId, quiet: bool) {
        let branch_size = match self.nodes.get(&branch) {
            Some(n) => n.branch_size(),
            None => return,
        };
        let mut cur = match self.nodes.get(&branch).and_then(TreeNode::parent) {
            Some(p) => p,
            None => return,
        };
        loop {
            let Some(node) = self.nodes.get(&cur) else {
                return;
            };
            let owns = node.owns_branch();
            if let Some(n) = self.nodes.get_mut(&cur) {
                n.branch_size += branch_size;
            }
            if owns {
                let Some(pos) = self.index_in_owner(cur, branch) else {
                    // The owner's array was rebuilt underneath us (a reload
                    // raced this merge); nothing sane to splice into.
                    return;
                };
                let span = self
                    .nodes
                    .get_mut(&branch)
                    .and_then(|n| n.flattened_branch.take())
                    .unwrap_or_default();
                if let Some(owner) = self.nodes.get_mut(&cur) {
                    if let Some(flat) = owner.flattened_branch.as_mut() {
                        let at = pos + 1;
                        flat.splice(at..at, span);
                    }
                }
                if cur == self.root && !quiet {
                    self.watcher.notify(TreeEvent::BranchDidUpdate);
                }
                return;
            }
            match self.nodes.get(&cur).and_then(TreeNode::parent) {
                Some(p) => cur = p,
                None => return,
            }
        }
    }

    /// Inverse of `expand_branch`: extract `branch`'s span out of the owner's
    /// array back into the branch itself, decrementing sizes along the way.
    fn shrink_branch(&mut self, branch: NodeId, quiet: bool) {
        let branch_size = match self.nodes.get(&branch) {
            Some(n) => n.branch_size(),
            None => return,
        };
        let mut cur = match self.nodes.get(&branch).and_then(TreeNode::parent) {
            Some(p) => p,
            None => return,
        };
        loop {
            let Some(node) = self.nodes.get(&cur) else {
                return;
            };
            let owns = node.owns_branch();
            if let Some(n) = self.nodes.get_mut(&cur) {
                n.branch_size = n.branch_size.saturating_sub(branch_size);
            }
            if owns {
                let Some(pos) = self.index_in_owner(cur, branch) else {
                    return;
                };
                let start = pos + 1;
                if let Some(owner) = self.nodes.get_mut(&cur) {
                    if let Some(flat) = owner.flattened_branch.as_mut() {
                        let end = (start + branch_size).min(flat.len());
                        let span: Vec<NodeId> = flat.drain(start..end).collect();
                        if let Some(b) = self.nodes.get_mut(&branch) {
                            b.flattened_branch = Some(span);
                        }
                    }
                }
                if cur == self.root && !quiet {
                    self.watcher.notify(TreeEvent::BranchDidUpdate);
                }
                return;
            }
            match self.nodes.get(&cur).and_then(TreeNode::parent) {
                Some(p) => cur = p,
                None => return,
            }
        }
    }

    fn index_in_owner(&self, owner: NodeId, id: NodeId) -> Option<usize> {
        self.nodes
            .get(&owner)?
            .flattened_branch()?
            .iter()
            .position(|&n| n == id)
    }

    // ── Insert / unlink / move ──────────────────────────────────────────────

    /// Materialize `item` as a child of `parent` and splice it into the
    /// surface at its sorted position.
    pub fn insert_item(&mut self, parent: NodeId, item: NodeItem) -> Result<NodeId> {
        let pnode = self.expect_node(parent)?;
        if !pnode.is_composite() {
            return Err(TreeError::NotComposite(pnode.path().to_string()));
        }
        let id = self.materialize(parent, &item);
        self.insert_node(parent, id, false);
        Ok(id)
    }

    /// Remove `child` from `parent` and dispose its subtree. A no-op when
    /// the parent is not currently surface-visible: deletions inside a
    /// hidden branch defer to the next reload of that branch.
    pub fn unlink_item(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let pnode = self.expect_node(parent)?;
        if !pnode.is_composite() {
            return Err(TreeError::NotComposite(pnode.path().to_string()));
        }
        self.expect_node(child)?;
        if !self.is_item_visible_at_surface(parent) {
            return Ok(());
        }
        if self.unlink_surgery(parent, child, false) {
            self.dispose_subtree(child);
        }
        Ok(())
    }

    /// Move and/or rename a node. `to = None` removes the node entirely
    /// (dispose semantics). Re-homes descendant paths recursively.
    pub fn mv(&mut self, id: NodeId, to: Option<NodeId>, name: Option<&str>) -> Result<()> {
        let node = self.expect_node(id)?;
        if node.is_root() {
            return Err(TreeError::RootOperation("move"));
        }
        let prev_parent = node.parent().expect("non-root node has a parent");
        let prev_path = node.path().to_string();
        let current_name = node.name().to_string();

        let Some(target) = to else {
            self.unlink_surgery(prev_parent, id, false);
            if let Some(n) = self.nodes.get_mut(&id) {
                n.parent = None;
            }
            self.dispose_subtree(id);
            return Ok(());
        };

        let tnode = self.expect_node(target)?;
        if !tnode.is_composite() {
            return Err(TreeError::NotComposite(tnode.path().to_string()));
        }
        let new_name = name.unwrap_or(&current_name).to_string();
        let changed_parent = prev_parent != target;

        if changed_parent || new_name != current_name {
            self.set_metadata_value(id, "name", Value::String(new_name.clone()));
            if changed_parent {
                self.watcher.notify(TreeEvent::WillChangeParent {
                    id,
                    from: prev_parent,
                    to: target,
                });
            }
            self.unlink_surgery(prev_parent, id, false);
            if let Some(n) = self.nodes.get_mut(&id) {
                n.parent = Some(target);
            }
            self.insert_node(target, id, false);
            if changed_parent {
                self.watcher.notify(TreeEvent::DidChangeParent {
                    id,
                    from: prev_parent,
                    to: target,
                });
            }
        }

        let (parent_path, parent_depth) = {
            let t = self.expect_node(target)?;
            (t.path().to_string(), t.depth())
        };
        let new_path = format!("{parent_path}/{new_name}");
        if new_path != prev_path {
            self.rehome(id, parent_depth + 1, &new_path);
        }
        Ok(())
    }

    /// Splice an already-materialized node into `parent` at its sorted
    /// position, propagating the branch-size increase up to the nearest
    /// owner. An unloaded parent only gets the size bump: the child will
    /// surface when the parent's children are resolved.
    fn insert_node(&mut self, parent: NodeId, child: NodeId, quiet: bool) {
        let increase = match self.nodes.get(&child) {
            Some(n) => n.surface_contribution(),
            None => return,
        };
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.branch_size += increase;
        }
        let mut master = parent;
        while !self.nodes.get(&master).is_some_and(TreeNode::owns_branch) {
            let Some(up) = self.nodes.get(&master).and_then(TreeNode::parent) else {
                break;
            };
            master = up;
            if let Some(m) = self.nodes.get_mut(&master) {
                m.branch_size += increase;
            }
        }

        let Some(mut ids) = self.nodes.get_mut(&parent).and_then(|p| p.children.take()) else {
            return;
        };
        ids.push(child);
        self.sort_ids(&mut ids);
        let rel = ids.iter().position(|&c| c == child).unwrap_or(0);
        let leading = if rel > 0 { Some(ids[rel - 1]) } else { None };
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children = Some(ids);
        }

        if !self.nodes.get(&master).is_some_and(TreeNode::owns_branch) {
            return;
        }
        let at = match leading {
            Some(sibling) => {
                let Some(pos) = self.index_in_owner(master, sibling) else {
                    return;
                };
                pos + self
                    .nodes
                    .get(&sibling)
                    .map_or(1, TreeNode::surface_contribution)
            }
            None => {
                if master == parent {
                    0
                } else {
                    let Some(pos) = self.index_in_owner(master, parent) else {
                        return;
                    };
                    pos + 1
                }
            }
        };
        let mut span = vec![child];
        let pre_expanded = self
            .nodes
            .get(&child)
            .is_some_and(|c| c.is_composite() && c.is_expanded() && c.owns_branch());
        if pre_expanded {
            if let Some(own) = self
                .nodes
                .get_mut(&child)
                .and_then(|c| c.flattened_branch.take())
            {
                span.extend(own);
            }
        }
        if let Some(m) = self.nodes.get_mut(&master) {
            if let Some(flat) = m.flattened_branch.as_mut() {
                let at = at.min(flat.len());
                flat.splice(at..at, span);
            }
        }
        if master == self.root && !quiet {
            self.watcher.notify(TreeEvent::BranchDidUpdate);
        }
    }

    /// Detach `child` from `parent`'s child list and surface arrays without
    /// disposing it. An expanded composite child keeps its extracted span as
    /// its own flattened array (it may be re-inserted elsewhere).
    fn unlink_surgery(&mut self, parent: NodeId, child: NodeId, quiet: bool) -> bool {
        let Some(idx) = self
            .nodes
            .get(&parent)
            .and_then(|p| p.children())
            .and_then(|c| c.iter().position(|&n| n == child))
        else {
            return false;
        };
        let decrease = match self.nodes.get(&child) {
            Some(n) => n.surface_contribution(),
            None => return false,
        };
        if let Some(p) = self.nodes.get_mut(&parent) {
            if let Some(children) = p.children.as_mut() {
                children.remove(idx);
            }
            p.branch_size = p.branch_size.saturating_sub(decrease);
        }
        let mut master = parent;
        while !self.nodes.get(&master).is_some_and(TreeNode::owns_branch) {
            let Some(up) = self.nodes.get(&master).and_then(TreeNode::parent) else {
                return true;
            };
            master = up;
            if let Some(m) = self.nodes.get_mut(&master) {
                m.branch_size = m.branch_size.saturating_sub(decrease);
            }
        }
        let Some(begin) = self.index_in_owner(master, child) else {
            return true;
        };
        let keeps_span = self
            .nodes
            .get(&child)
            .is_some_and(|c| c.is_composite() && c.is_expanded());
        if let Some(m) = self.nodes.get_mut(&master) {
            if let Some(flat) = m.flattened_branch.as_mut() {
                let end = (begin + decrease).min(flat.len());
                let removed: Vec<NodeId> = flat.drain(begin..end).collect();
                if keeps_span {
                    if let Some(c) = self.nodes.get_mut(&child) {
                        // Drop the child's own row, keep its descendants.
                        c.flattened_branch = Some(removed[1..].to_vec());
                    }
                }
            }
        }
        if master == self.root && !quiet {
            self.watcher.notify(TreeEvent::BranchDidUpdate);
        }
        true
    }

    fn rehome(&mut self, id: NodeId, depth: usize, new_path: &str) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let old_path = node.path().to_string();
        if self.path_index.get(&old_path) == Some(&id) {
            self.path_index.remove(&old_path);
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.path = new_path.to_string();
            n.depth = depth;
        }
        self.path_index.insert(new_path.to_string(), id);
        self.id_by_path.insert(new_path.to_string(), id);
        self.watcher.notify(TreeEvent::DidChangePath {
            id,
            path: new_path.to_string(),
        });
        let kids: Vec<NodeId> = self
            .nodes
            .get(&id)
            .and_then(|n| n.children())
            .map(<[NodeId]>::to_vec)
            .unwrap_or_default();
        for kid in kids {
            let kname = self
                .nodes
                .get(&kid)
                .map(|k| k.name().to_string())
                .unwrap_or_default();
            self.rehome(kid, depth + 1, &format!("{new_path}/{kname}"));
        }
    }

    // ── Metadata and visibility ─────────────────────────────────────────────

    /// Add or update a metadata entry. Names must change through [`Tree::mv`]
    /// so the path registry stays consistent.
    pub fn add_metadata(&mut self, id: NodeId, key: &str, value: Value) -> Result<()> {
        self.expect_node(id)?;
        self.set_metadata_value(id, key, value);
        Ok(())
    }

    pub fn remove_metadata(&mut self, id: NodeId, key: &str) -> Result<()> {
        self.expect_node(id)?;
        let prev = self.nodes.get_mut(&id).and_then(|n| n.metadata.remove(key));
        if let Some(prev_value) = prev {
            self.watcher.notify(TreeEvent::DidChangeMetadata {
                id,
                change: MetadataChange {
                    change_type: MetadataChangeType::Removed,
                    key: key.to_string(),
                    prev_value: Some(prev_value),
                    value: None,
                },
            });
        }
        Ok(())
    }

    fn set_metadata_value(&mut self, id: NodeId, key: &str, value: Value) {
        let prev = self
            .nodes
            .get_mut(&id)
            .and_then(|n| n.metadata.insert(key.to_string(), value.clone()));
        let change_type = if prev.is_some() {
            MetadataChangeType::Updated
        } else {
            MetadataChangeType::Added
        };
        self.watcher.notify(TreeEvent::DidChangeMetadata {
            id,
            change: MetadataChange {
                change_type,
                key: key.to_string(),
                prev_value: prev,
                value: Some(value),
            },
        });
    }

    /// Toggle the soft-hide flag. Structure and indices are unaffected.
    pub fn set_visible(&mut self, id: NodeId, visible: bool) -> Result<()> {
        self.expect_node(id)?;
        if let Some(n) = self.nodes.get_mut(&id) {
            n.visible = visible;
        }
        Ok(())
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// Record a refresh request without driving it. Requests merge by
    /// keeping the longest path set (more paths ⇒ superset of work), so any
    /// number of queued calls collapse into at most one follow-up reload.
    pub fn queue_refresh(&mut self, paths: Vec<String>) {
        match &self.refresh_pending {
            Some(pending) if pending.len() >= paths.len() => {}
            _ => self.refresh_pending = Some(paths),
        }
    }

    /// Coalescing reload. Merges with any queued request, then drains the
    /// queue: one reload in flight, at most one queued follow-up, regardless
    /// of call volume. Expansion state is preserved by replaying the
    /// previously-expanded paths after each reload.
    pub async fn refresh(&mut self, paths: Vec<String>) -> Result<()> {
        self.queue_refresh(paths);
        if self.refresh_in_flight {
            return Ok(());
        }
        self.refresh_in_flight = true;
        while let Some(set) = self.refresh_pending.take() {
            let target = self.refresh_target(&set);
            let result = self.reload_subtree(target).await;
            if let Err(e) = result {
                self.refresh_in_flight = false;
                return Err(e);
            }
        }
        self.refresh_in_flight = false;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_refresh_paths(&self) -> Option<&[String]> {
        self.refresh_pending.as_deref()
    }

    /// Deepest common ancestor of the requested paths; unknown paths widen
    /// the reload to the root.
    fn refresh_target(&self, paths: &[String]) -> NodeId {
        let mut ids = Vec::new();
        for p in paths {
            match self.path_index.get(&self.absolute_path(p)) {
                Some(&id) => {
                    // Leaves reload through their containing composite.
                    let id = match self.nodes.get(&id) {
                        Some(n) if !n.is_composite() => n.parent().unwrap_or(self.root),
                        _ => id,
                    };
                    ids.push(id);
                }
                None => return self.root,
            }
        }
        let Some(mut acc) = ids.first().copied() else {
            return self.root;
        };
        for &id in &ids[1..] {
            acc = self.common_ancestor(acc, id);
        }
        acc
    }

    fn common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let (mut x, mut y) = (a, b);
        loop {
            let (Some(nx), Some(ny)) = (self.nodes.get(&x), self.nodes.get(&y)) else {
                return self.root;
            };
            if x == y {
                return x;
            }
            match nx.depth().cmp(&ny.depth()) {
                Ordering::Greater => x = nx.parent().unwrap_or(self.root),
                Ordering::Less => y = ny.parent().unwrap_or(self.root),
                Ordering::Equal => {
                    x = nx.parent().unwrap_or(self.root);
                    y = ny.parent().unwrap_or(self.root);
                }
            }
        }
    }

    async fn reload_subtree(&mut self, target: NodeId) -> Result<()> {
        let Some(node) = self.nodes.get(&target) else {
            return Ok(());
        };
        if !node.is_composite() {
            return Ok(());
        }
        if !node.is_expanded() {
            // A collapsed node drops its loaded children and picks up fresh
            // content on its next expansion.
            if node.children().is_some() && !node.is_root() {
                let old = self
                    .nodes
                    .get_mut(&target)
                    .and_then(|n| n.children.take())
                    .unwrap_or_default();
                for child in old {
                    self.dispose_subtree(child);
                }
                if let Some(n) = self.nodes.get_mut(&target) {
                    n.flattened_branch = None;
                    n.branch_size = 0;
                }
            }
            return Ok(());
        }

        let mut expanded_paths = self.expanded_descendant_paths(target);
        let loaded = self.hard_reload_children(target, true).await?;
        if !loaded {
            return Ok(());
        }
        if target != self.root {
            self.expand_branch(target, true);
        }
        // Ancestors before descendants, so each path finds its parent loaded.
        expanded_paths.sort_by_key(|p| p.matches('/').count());
        for path in expanded_paths {
            if let Some(&id) = self.path_index.get(&path) {
                self.expand_node(id, true).await?;
            }
        }
        self.watcher.notify(TreeEvent::BranchDidUpdate);
        Ok(())
    }

    /// Absolute paths of every expanded composite strictly below `id`.
    fn expanded_descendant_paths(&self, id: NodeId) -> Vec<String> {
        let mut out = Vec::new();
        let Some(children) = self.nodes.get(&id).and_then(TreeNode::children) else {
            return out;
        };
        for &child in children {
            if let Some(c) = self.nodes.get(&child) {
                if c.is_composite() && c.is_expanded() {
                    out.push(c.path().to_string());
                    out.extend(self.expanded_descendant_paths(child));
                }
            }
        }
        out
    }

    /// Absolute paths of every loaded-but-collapsed composite below `id`.
    fn collapsed_descendant_paths(&self, id: NodeId) -> Vec<String> {
        let mut out = Vec::new();
        let Some(children) = self.nodes.get(&id).and_then(TreeNode::children) else {
            return out;
        };
        for &child in children {
            if let Some(c) = self.nodes.get(&child) {
                if c.is_composite() {
                    if c.is_expanded() {
                        out.extend(self.collapsed_descendant_paths(child));
                    } else {
                        out.push(c.path().to_string());
                    }
                }
            }
        }
        out
    }

    // ── Bulk expansion ──────────────────────────────────────────────────────

    /// Expand every currently-known collapsed composite, deepest first.
    /// The token is allocated per call but not consulted mid-traversal, so a
    /// running bulk toggle cannot be interrupted.
    pub async fn expand_all(&mut self) -> Result<()> {
        let _cancellation = CancellationToken::new();
        let mut paths = self.collapsed_descendant_paths(self.root);
        paths.sort_by_key(|p| p.matches('/').count());
        while let Some(path) = paths.pop() {
            if let Some(&id) = self.path_index.get(&path) {
                if self.nodes.get(&id).is_some_and(TreeNode::is_composite) {
                    self.expand_node(id, true).await?;
                }
            }
        }
        self.watcher.notify(TreeEvent::BranchDidUpdate);
        Ok(())
    }

    /// Collapse every expanded composite below the root, deepest first.
    pub async fn collapse_all(&mut self) -> Result<()> {
        let _cancellation = CancellationToken::new();
        let mut paths = self.expanded_descendant_paths(self.root);
        paths.sort_by_key(|p| p.matches('/').count());
        while let Some(path) = paths.pop() {
            if let Some(&id) = self.path_index.get(&path) {
                self.set_collapsed(id, true)?;
            }
        }
        self.watcher.notify(TreeEvent::BranchDidUpdate);
        Ok(())
    }

    // ── Path loading ────────────────────────────────────────────────────────

    /// Walk `path` segment by segment, lazily expanding composites along the
    /// way. Compacted nodes — whose displayed name embeds several path
    /// segments (`a/b`) — match a run of requested segments.
    pub async fn load_node_by_path(&mut self, path: &str) -> Result<Option<NodeId>> {
        let abs = self.absolute_path(path);
        let root_path = self
            .nodes
            .get(&self.root)
            .map(|r| r.path().to_string())
            .unwrap_or_default();
        let rel = abs
            .strip_prefix(&root_path)
            .unwrap_or(&abs)
            .trim_matches('/')
            .to_string();
        if rel.is_empty() {
            return Ok(Some(self.root));
        }
        self.ensure_loaded(self.root).await?;

        let mut segments: std::collections::VecDeque<String> =
            rel.split('/').map(str::to_string).collect();
        let mut cur = self.root;
        while let Some(seg) = segments.pop_front() {
            let children: Vec<NodeId> = match self.nodes.get(&cur).and_then(TreeNode::children) {
                Some(c) => c.to_vec(),
                None => return Ok(None),
            };
            let mut found = None;
            for &cid in &children {
                let Some(c) = self.nodes.get(&cid) else {
                    continue;
                };
                if c.name() == seg || c.name().starts_with(&format!("{seg}/")) {
                    found = Some(cid);
                    break;
                }
            }
            let Some(child) = found else {
                return Ok(None);
            };
            let child_name = self
                .nodes
                .get(&child)
                .map(|c| c.name().to_string())
                .unwrap_or_default();
            if child_name != seg {
                // Compacted row: consume the segments folded into its name.
                for part in child_name.split('/').skip(1) {
                    match segments.front() {
                        Some(next) if next == part => {
                            segments.pop_front();
                        }
                        // The requested path diverges inside the compacted
                        // span, so it names nothing loadable.
                        _ => return Ok(None),
                    }
                }
            }
            let is_composite = self.nodes.get(&child).is_some_and(TreeNode::is_composite);
            if is_composite {
                let expanded = self.nodes.get(&child).is_some_and(TreeNode::is_expanded);
                if !expanded {
                    self.expand_node(child, true).await?;
                }
            } else if !segments.is_empty() {
                return Ok(None);
            }
            cur = child;
        }
        self.watcher.notify(TreeEvent::BranchDidUpdate);
        Ok(Some(cur))
    }

    // ── Watch events ────────────────────────────────────────────────────────

    /// Apply an external mutation notification. Unknown paths are ignored;
    /// `Changed` under a branch that is not surface-visible defers (the
    /// branch collapses and reloads on next expansion) instead of reloading.
    pub async fn dispatch_watch_event(&mut self, event: WatchEvent) -> Result<()> {
        match event.clone() {
            WatchEvent::Added { parent, item } => {
                let Some(&pid) = self.path_index.get(&self.absolute_path(&parent)) else {
                    return Ok(());
                };
                self.watcher.notify(TreeEvent::WillProcessWatchEvent {
                    id: pid,
                    event: event.clone(),
                });
                self.insert_item(pid, item)?;
                self.watcher
                    .notify(TreeEvent::DidProcessWatchEvent { id: pid, event });
            }
            WatchEvent::Removed { path } => {
                let abs = self.absolute_path(&path);
                let (dir, name) = split_path(&abs);
                let Some(&pid) = self.path_index.get(dir) else {
                    return Ok(());
                };
                self.watcher.notify(TreeEvent::WillProcessWatchEvent {
                    id: pid,
                    event: event.clone(),
                });
                if let Some(cid) = self.child_by_name(pid, name) {
                    self.unlink_item(pid, cid)?;
                }
                self.watcher
                    .notify(TreeEvent::DidProcessWatchEvent { id: pid, event });
            }
            WatchEvent::Moved { old_path, new_path } => {
                let old_abs = self.absolute_path(&old_path);
                let new_abs = self.absolute_path(&new_path);
                let (from_dir, old_name) = split_path(&old_abs);
                let (to_dir, new_name) = split_path(&new_abs);
                let Some(&pid) = self.path_index.get(from_dir) else {
                    return Ok(());
                };
                self.watcher.notify(TreeEvent::WillProcessWatchEvent {
                    id: pid,
                    event: event.clone(),
                });
                if let Some(cid) = self.child_by_name(pid, old_name) {
                    if to_dir == from_dir {
                        self.mv(cid, Some(pid), Some(new_name))?;
                    } else {
                        let dest = self.path_index.get(to_dir).copied();
                        match dest {
                            Some(did)
                                if self.nodes.get(&did).is_some_and(TreeNode::is_composite) =>
                            {
                                self.mv(cid, Some(did), Some(new_name))?;
                            }
                            // Destination not materialized here: treat as a
                            // removal from this tree's perspective.
                            _ => self.unlink_item(pid, cid)?,
                        }
                    }
                }
                self.watcher
                    .notify(TreeEvent::DidProcessWatchEvent { id: pid, event });
            }
            WatchEvent::Changed { path } => {
                let abs = self.absolute_path(&path);
                let id = match self.path_index.get(&abs) {
                    Some(&id) if self.nodes.get(&id).is_some_and(TreeNode::is_composite) => id,
                    _ => {
                        let (dir, _) = split_path(&abs);
                        match self.path_index.get(dir) {
                            Some(&id) => id,
                            None => return Ok(()),
                        }
                    }
                };
                self.watcher.notify(TreeEvent::WillProcessWatchEvent {
                    id,
                    event: event.clone(),
                });
                if self.is_item_visible_at_surface(id) || id == self.root {
                    let target_path = self
                        .nodes
                        .get(&id)
                        .map(|n| n.path().to_string())
                        .unwrap_or(abs);
                    self.refresh(vec![target_path]).await?;
                } else {
                    // Hidden branch: fold it up and let the next expansion
                    // pick up fresh content.
                    let old = self
                        .nodes
                        .get_mut(&id)
                        .and_then(|n| n.children.take())
                        .unwrap_or_default();
                    for child in old {
                        self.dispose_subtree(child);
                    }
                    if let Some(n) = self.nodes.get_mut(&id) {
                        n.expansion = ExpansionState::Collapsed;
                        n.flattened_branch = None;
                        n.branch_size = 0;
                    }
                }
                self.watcher
                    .notify(TreeEvent::DidProcessWatchEvent { id, event });
            }
        }
        Ok(())
    }

    fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(&parent)?
            .children()?
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(|n| n.name() == name))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Dispose the whole tree. Queries answer `None` afterwards.
    pub fn dispose(&mut self) {
        let root = self.root;
        self.dispose_subtree(root);
    }

    /// Dispose a subtree: children first, then the node itself. Registry
    /// entries are removed; the id-by-path cache is kept so a future node at
    /// the same path reuses the id.
    fn dispose_subtree(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.expansion = ExpansionState::Collapsed;
        node.flattened_branch = None;
        let kids = node.children.take().unwrap_or_default();
        for kid in kids {
            self.dispose_subtree(kid);
        }
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.disposed = true;
        let path = node.path.clone();
        if self.path_index.get(&path) == Some(&id) {
            self.path_index.remove(&path);
        }
        self.nodes.remove(&id);
        self.watcher.notify(TreeEvent::DidDispose { id, path });
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn expect_node(&self, id: NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TreeError::UnknownNode(id.to_string()))
    }

    fn resolve_context(&self, id: NodeId) -> Option<ResolveContext> {
        let node = self.nodes.get(&id)?;
        Some(ResolveContext {
            id,
            path: node.path().to_string(),
            relative_path: self.relative_path_of(id).unwrap_or_default(),
            depth: node.depth(),
            metadata: node.metadata().clone(),
        })
    }

    /// Create a node slot for a resolved child. A previous id for the same
    /// path is reused; a live node already at that path is replaced.
    fn materialize(&mut self, parent: NodeId, item: &NodeItem) -> NodeId {
        let parent_path = self
            .nodes
            .get(&parent)
            .map(|p| p.path().to_string())
            .unwrap_or_default();
        let path = format!("{}/{}", parent_path, item.name);
        if let Some(&old) = self.path_index.get(&path) {
            if self.nodes.contains_key(&old) {
                if let Some(op) = self.nodes.get(&old).and_then(TreeNode::parent) {
                    self.unlink_surgery(op, old, true);
                }
                self.dispose_subtree(old);
            }
        }
        let id = match self.id_by_path.get(&path) {
            Some(&cached) if !self.nodes.contains_key(&cached) => cached,
            _ => {
                let id = NodeId(self.next_id);
                self.next_id += 1;
                id
            }
        };
        let node = {
            let pnode = self.nodes.get(&parent).expect("parent node exists");
            TreeNode::new(id, item.kind, Some(pnode), &item.name, item.metadata.clone())
        };
        self.path_index.insert(path.clone(), id);
        self.id_by_path.insert(path, id);
        self.nodes.insert(id, node);
        id
    }

    fn sort_ids(&self, ids: &mut Vec<NodeId>) {
        let nodes = &self.nodes;
        let resolver = &self.resolver;
        ids.sort_by(|a, b| match (nodes.get(a), nodes.get(b)) {
            (Some(x), Some(y)) => resolver.compare(x, y),
            _ => Ordering::Equal,
        });
    }
}

/// Split an absolute tree path into (directory, base name).
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}
