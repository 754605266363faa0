use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Process-unique node identifier, monotonically assigned by the owning
/// tree's arena. Disposed ids are never reused for a different path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node discriminant. A `Leaf` never carries children; a `Composite` owns an
/// ordered child list and participates in flattened-branch bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Composite,
}

/// Expansion state machine for composite nodes.
///
/// `Loading` covers the window between the expand request and the resolver
/// completing; a collapse arriving in that window flips the state back to
/// `Collapsed` and the pending expand is abandoned when it re-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    Collapsed,
    Loading,
    Expanded,
}

/// A raw child description returned by a resolver, not yet materialized into
/// the arena. `name` must be unique among its siblings since paths derive
/// from it.
#[derive(Debug, Clone)]
pub struct NodeItem {
    pub name: String,
    pub kind: NodeKind,
    pub metadata: HashMap<String, Value>,
}

impl NodeItem {
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Leaf,
            metadata: HashMap::new(),
        }
    }

    pub fn composite(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Composite,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A node slot in the tree arena.
///
/// The parent link is a non-owning back-reference; the parent exclusively
/// owns the ordered `children` vector. Composite-only fields (`expansion`,
/// `children`, `branch_size`, `flattened_branch`) stay at their defaults for
/// leaves.
#[derive(Debug)]
pub struct TreeNode {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) depth: usize,
    pub(crate) path: String,
    pub(crate) metadata: HashMap<String, Value>,
    pub(crate) visible: bool,
    pub(crate) disposed: bool,
    pub(crate) expansion: ExpansionState,
    /// `None` until the first load; an empty vec is a *loaded* empty node.
    pub(crate) children: Option<Vec<NodeId>>,
    /// Rows this node's branch contributes to the surface when expanded:
    /// direct children plus the branch sizes of expanded composite children.
    pub(crate) branch_size: usize,
    /// Depth-first visible descendant ids. Non-`None` only on a branch
    /// owner: the root, or a collapsed node holding its extracted span.
    pub(crate) flattened_branch: Option<Vec<NodeId>>,
}

impl TreeNode {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        parent: Option<&TreeNode>,
        name: &str,
        mut metadata: HashMap<String, Value>,
    ) -> Self {
        metadata.insert("name".into(), Value::String(name.to_string()));
        let (depth, path) = match parent {
            Some(p) => (p.depth + 1, format!("{}/{}", p.path, name)),
            None => (0, format!("/{name}")),
        };
        Self {
            id,
            kind,
            parent: parent.map(|p| p.id),
            depth,
            path,
            metadata,
            visible: true,
            disposed: false,
            // The root is constructed without a parent and is permanently
            // expanded; everything else starts collapsed.
            expansion: if parent.is_none() {
                ExpansionState::Expanded
            } else {
                ExpansionState::Collapsed
            },
            children: None,
            branch_size: 0,
            flattened_branch: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_composite(&self) -> bool {
        self.kind == NodeKind::Composite
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Absolute tree path, `/<root-name>/.../<name>`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The required `name` metadata entry.
    pub fn name(&self) -> &str {
        match self.metadata.get("name") {
            Some(Value::String(s)) => s,
            _ => "",
        }
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Soft-hide flag, independent of tree structure. Renderer concern only:
    /// an invisible node still occupies its surface slot.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_expanded(&self) -> bool {
        self.expansion == ExpansionState::Expanded
    }

    pub(crate) fn expansion(&self) -> ExpansionState {
        self.expansion
    }

    /// Loaded child ids, `None` before the first resolution.
    pub fn children(&self) -> Option<&[NodeId]> {
        self.children.as_deref()
    }

    pub fn branch_size(&self) -> usize {
        self.branch_size
    }

    pub(crate) fn flattened_branch(&self) -> Option<&[NodeId]> {
        self.flattened_branch.as_deref()
    }

    pub(crate) fn owns_branch(&self) -> bool {
        self.flattened_branch.is_some()
    }

    /// Surface rows contributed when this node sits on a parent's surface:
    /// its own row plus, if expanded, its branch.
    pub(crate) fn surface_contribution(&self) -> usize {
        if self.is_composite() && self.is_expanded() {
            1 + self.branch_size
        } else {
            1
        }
    }
}
