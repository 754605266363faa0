//! Expansion and scroll state tracking.
//!
//! A [`TreeStateManager`] lives alongside one tree root and consumes its
//! structural events for the lifetime of that root. It keeps the set of
//! expanded directories (split into surface-visible and buried at snapshot
//! time), the scroll offset, and a stash journal that can roll back a
//! temporary run of expand/collapse operations without clobbering changes
//! the user made while the stash was active.

mod watcher;

pub use watcher::{
    ExpandedDirectories, SerializableTreeState, TreeStateWatcher, TREE_STATE_SPEC_VERSION,
};

use std::collections::HashMap;

use bitflags::bitflags;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::TreeEvent;
use crate::tree::node::NodeId;
use crate::tree::Tree;

bitflags! {
    /// Journal entry flags. `DISABLED` marks entries the reverse pass must
    /// skip because the user deliberately re-toggled the node mid-stash.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StashFlags: u8 {
        const EXPANDED = 1;
        const COLLAPSED = 1 << 1;
        const DISABLED = 1 << 2;
    }
}

#[derive(Debug)]
struct JournalEntry {
    id: NodeId,
    relative_path: String,
    flags: StashFlags,
}

/// Tracks expansion and scroll state for one tree root.
///
/// Feed it the root's event stream via [`TreeStateManager::on_tree_event`];
/// it never mutates the tree on its own (the reverse-stash and restore
/// operations are explicit calls).
#[derive(Default)]
pub struct TreeStateManager {
    /// Expanded composites, keyed by id, valued with their root-relative
    /// path (what gets serialized).
    expanded: HashMap<NodeId, String>,
    scroll_offset: f64,
    stashing: bool,
    journal: Vec<JournalEntry>,
    /// Buried paths from a loaded snapshot, waiting for the user to
    /// navigate near them (see [`TreeStateManager::restore_buried_under`]).
    pending_buried: Vec<String>,
    senders: Vec<mpsc::UnboundedSender<SerializableTreeState>>,
}

impl TreeStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one structural event from the tree this manager tracks.
    pub fn on_tree_event(&mut self, tree: &Tree, event: &TreeEvent) {
        match event {
            TreeEvent::DidChangeExpansionState { id, expanded, .. } => {
                if *expanded {
                    if let Some(rel) = tree.relative_path_of(*id) {
                        self.expanded.insert(*id, rel);
                    }
                } else {
                    self.expanded.remove(id);
                }
                if self.stashing {
                    self.record(tree, *id, *expanded);
                }
                self.emit(tree);
            }
            TreeEvent::DidChangePath { id, .. } => {
                if self.expanded.contains_key(id) {
                    if let Some(rel) = tree.relative_path_of(*id) {
                        self.expanded.insert(*id, rel);
                    }
                    self.emit(tree);
                }
            }
            TreeEvent::DidDispose { id, .. } => {
                if self.expanded.remove(id).is_some() {
                    self.emit(tree);
                }
            }
            TreeEvent::BranchDidUpdate => {
                self.emit(tree);
            }
            _ => {}
        }
    }

    /// Record the renderer's scroll offset (rows or pixels; the tree does
    /// not interpret it).
    pub fn save_scroll_offset(&mut self, tree: &Tree, offset: f64) {
        self.scroll_offset = offset;
        self.emit(tree);
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    /// Whether `id` is currently tracked as expanded.
    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.expanded.contains_key(&id)
    }

    // ── Stash journal ───────────────────────────────────────────────────────

    /// Start journaling expand/collapse operations for a later rollback.
    pub fn begin_stashing(&mut self) {
        self.stashing = true;
        self.journal.clear();
    }

    pub fn is_stashing(&self) -> bool {
        self.stashing
    }

    fn record(&mut self, tree: &Tree, id: NodeId, expanded: bool) {
        let opposite = if expanded {
            StashFlags::COLLAPSED
        } else {
            StashFlags::EXPANDED
        };
        // A re-toggle of a journaled node is a deliberate user change: the
        // reverse pass must not clobber it, nor fold up the ancestors that
        // keep it visible.
        if let Some(pos) = self.journal.iter().rposition(|e| {
            e.id == id && e.flags.contains(opposite) && !e.flags.contains(StashFlags::DISABLED)
        }) {
            let path = self.journal[pos].relative_path.clone();
            self.journal[pos].flags |= StashFlags::DISABLED;
            let prefix = format!("{path}/");
            for entry in &mut self.journal {
                if !entry.flags.contains(StashFlags::DISABLED)
                    && prefix.starts_with(&format!("{}/", entry.relative_path))
                {
                    entry.flags |= StashFlags::DISABLED;
                }
            }
            return;
        }
        let Some(rel) = tree.relative_path_of(id) else {
            return;
        };
        self.journal.push(JournalEntry {
            id,
            relative_path: rel,
            flags: if expanded {
                StashFlags::EXPANDED
            } else {
                StashFlags::COLLAPSED
            },
        });
    }

    /// Walk the journal in reverse, applying the opposite of each recorded
    /// operation and skipping disabled entries. Ends the stash window.
    pub async fn reverse_stash(&mut self, tree: &mut Tree) -> Result<()> {
        self.stashing = false;
        let entries: Vec<JournalEntry> = self.journal.drain(..).collect();
        for entry in entries.iter().rev() {
            if entry.flags.contains(StashFlags::DISABLED) {
                continue;
            }
            let Some(node) = tree.node_by_path(&entry.relative_path) else {
                continue;
            };
            let id = node.id();
            if entry.flags.contains(StashFlags::EXPANDED) {
                tree.set_collapsed(id, false)?;
            } else if entry.flags.contains(StashFlags::COLLAPSED) {
                tree.set_expanded(id, false, false).await?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn journal_len(&self) -> usize {
        self.journal.len()
    }

    // ── Serialization ───────────────────────────────────────────────────────

    /// Current serializable state: expanded directories split into those
    /// contributing surface rows and those hidden beneath a collapsed
    /// ancestor, plus the scroll offset.
    pub fn snapshot(&self, tree: &Tree) -> SerializableTreeState {
        let mut at_surface = Vec::new();
        let mut buried = Vec::new();
        for (&id, rel) in &self.expanded {
            if tree.node(id).is_none() {
                continue;
            }
            if tree.is_item_visible_at_surface(id) {
                at_surface.push(rel.clone());
            } else {
                buried.push(rel.clone());
            }
        }
        // Ancestors first, then lexical, so restoration can replay in order.
        let depth_order = |p: &String| (p.matches('/').count(), p.clone());
        at_surface.sort_by_key(depth_order);
        buried.sort_by_key(depth_order);
        SerializableTreeState {
            spec_version: TREE_STATE_SPEC_VERSION,
            scroll_position: self.scroll_offset,
            expanded_directories: ExpandedDirectories { at_surface, buried },
        }
    }

    /// Restore a saved snapshot: surface expansions are replayed eagerly,
    /// buried ones are parked until navigation reaches them.
    pub async fn load_state(
        &mut self,
        tree: &mut Tree,
        state: &SerializableTreeState,
    ) -> Result<()> {
        self.scroll_offset = state.scroll_position;
        let mut paths = state.expanded_directories.at_surface.clone();
        paths.sort_by_key(|p| p.matches('/').count());
        for path in &paths {
            tree.load_node_by_path(path).await?;
            if let Some(node) = tree.node_by_path(path) {
                if node.is_expanded() {
                    self.expanded.insert(node.id(), path.clone());
                }
            }
        }
        self.pending_buried = state.expanded_directories.buried.clone();
        Ok(())
    }

    /// Buried paths still waiting to be restored.
    pub fn pending_buried(&self) -> &[String] {
        &self.pending_buried
    }

    /// Restore the parked buried expansions underneath `relative_path`.
    /// Hosts call this when the user expands into a region that was buried
    /// when the snapshot was taken.
    pub async fn restore_buried_under(
        &mut self,
        tree: &mut Tree,
        relative_path: &str,
    ) -> Result<()> {
        let prefix = format!("{relative_path}/");
        let mut matched: Vec<String> = Vec::new();
        self.pending_buried.retain(|p| {
            if p.starts_with(&prefix) || p == relative_path {
                matched.push(p.clone());
                false
            } else {
                true
            }
        });
        matched.sort_by_key(|p| p.matches('/').count());
        for path in &matched {
            tree.load_node_by_path(path).await?;
            if let Some(node) = tree.node_by_path(path) {
                if node.is_expanded() {
                    self.expanded.insert(node.id(), path.clone());
                }
            }
        }
        Ok(())
    }

    // ── Watching ────────────────────────────────────────────────────────────

    /// Create a watcher seeded with the current state; it receives a fresh
    /// snapshot on every tracked change.
    pub fn watch(&mut self, tree: &Tree) -> TreeStateWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        TreeStateWatcher::new(rx, self.snapshot(tree))
    }

    fn emit(&mut self, tree: &Tree) {
        if self.senders.is_empty() {
            return;
        }
        let snapshot = self.snapshot(tree);
        self.senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}
