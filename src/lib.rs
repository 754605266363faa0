//! flatbranch — a virtualized, lazily-loaded tree engine.
//!
//! The engine keeps a renderer-consumable linear ordering (the "flattened
//! branch") of an arbitrarily large, mutable tree whose children resolve
//! lazily through a host-supplied [`TreeResolver`]. Expand, collapse,
//! insert, remove, and move all update the surface in O(affected-subtree).
//! On top of the core sit a copy-on-write decoration system
//! ([`DecorationsManager`]) and a persistable expansion/scroll state
//! tracker ([`TreeStateManager`]).
//!
//! A renderer drives it through a narrow contract: `node_at_index` /
//! `index_of_id` for the visible window, `branch_size` for virtualization,
//! and per-row class lists from the decorations manager.

pub mod config;
pub mod decoration;
pub mod error;
pub mod event;
pub mod fs;
pub mod state;
pub mod tree;

pub use decoration::{
    CompositeKind, Decoration, DecorationChange, DecorationData, DecorationId, DecorationsManager,
    TargetMatchMode,
};
pub use error::{Result, TreeError};
pub use event::{MetadataChange, MetadataChangeType, TreeEvent, TreeWatcher, WatchEvent};
pub use fs::{FsTreeResolver, FsWatcher, FsWatcherConfig};
pub use state::{
    ExpandedDirectories, SerializableTreeState, StashFlags, TreeStateManager, TreeStateWatcher,
    TREE_STATE_SPEC_VERSION,
};
pub use tree::node::{ExpansionState, NodeId, NodeItem, NodeKind, TreeNode};
pub use tree::{default_node_order, ResolveContext, Tree, TreeResolver};
