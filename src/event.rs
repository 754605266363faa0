use serde_json::Value;
use tokio::sync::mpsc;

use crate::tree::node::{NodeId, NodeItem};

/// How a metadata entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataChangeType {
    Added,
    Updated,
    Removed,
}

/// A single metadata mutation record, carried by `TreeEvent::DidChangeMetadata`.
#[derive(Debug, Clone)]
pub struct MetadataChange {
    pub change_type: MetadataChangeType,
    pub key: String,
    pub prev_value: Option<Value>,
    pub value: Option<Value>,
}

/// External mutation notifications a host feeds into the tree.
///
/// These describe changes to the backing model (e.g. a filesystem) that the
/// tree should mirror. `Added`/`Removed`/`Moved` are applied surgically;
/// `Changed` triggers a coalesced reload of the affected directory.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A new entry appeared under `parent` (a tree path).
    Added { parent: String, item: NodeItem },
    /// The entry at `path` disappeared.
    Removed { path: String },
    /// The entry at `old_path` is now at `new_path` (rename or move).
    Moved { old_path: String, new_path: String },
    /// The subtree at `path` changed in an unspecified way.
    Changed { path: String },
}

/// Structural events broadcast by the tree watcher.
///
/// Events are dispatched synchronously at the mutation site, in the order the
/// operations were applied, and are never dropped. Receivers drain at their
/// own pace.
#[derive(Debug, Clone)]
pub enum TreeEvent {
    /// An expansion-state flip is about to be committed.
    WillChangeExpansionState {
        id: NodeId,
        expanded: bool,
        visible_at_surface: bool,
    },
    /// An expansion-state flip was committed.
    DidChangeExpansionState {
        id: NodeId,
        expanded: bool,
        visible_at_surface: bool,
    },
    /// Children resolution is about to start for a node.
    WillResolveChildren { id: NodeId },
    /// Children resolution finished for a node.
    DidResolveChildren { id: NodeId },
    /// The flattened surface changed; the renderer should repaint.
    BranchDidUpdate,
    /// A node is about to be re-parented.
    WillChangeParent {
        id: NodeId,
        from: NodeId,
        to: NodeId,
    },
    /// A node was re-parented.
    DidChangeParent {
        id: NodeId,
        from: NodeId,
        to: NodeId,
    },
    /// A node's path changed (rename or move); carries the new path.
    DidChangePath { id: NodeId, path: String },
    /// A metadata entry was added, updated, or removed.
    DidChangeMetadata { id: NodeId, change: MetadataChange },
    /// A node was disposed; carries the path it had at disposal.
    DidDispose { id: NodeId, path: String },
    /// A watch event is about to be applied at `id`.
    WillProcessWatchEvent { id: NodeId, event: WatchEvent },
    /// A watch event was applied at `id`.
    DidProcessWatchEvent { id: NodeId, event: WatchEvent },
}

/// Per-root event dispatcher.
///
/// Fan-out over unbounded channels: `notify` clones the event to every live
/// subscriber and prunes closed ones. Unbounded sends cannot block, so
/// dispatch stays synchronous with the mutation that caused it.
#[derive(Default)]
pub struct TreeWatcher {
    senders: Vec<mpsc::UnboundedSender<TreeEvent>>,
}

impl TreeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all structural events of this tree.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TreeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Broadcast an event to every live subscriber.
    pub fn notify(&mut self, event: TreeEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers (dropped receivers are pruned on notify).
    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_receives_events() {
        let mut watcher = TreeWatcher::new();
        let mut rx = watcher.subscribe();
        watcher.notify(TreeEvent::BranchDidUpdate);
        assert!(matches!(rx.try_recv(), Ok(TreeEvent::BranchDidUpdate)));
    }

    #[test]
    fn events_fan_out_to_all_subscribers() {
        let mut watcher = TreeWatcher::new();
        let mut rx1 = watcher.subscribe();
        let mut rx2 = watcher.subscribe();
        watcher.notify(TreeEvent::BranchDidUpdate);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut watcher = TreeWatcher::new();
        let rx = watcher.subscribe();
        drop(rx);
        watcher.notify(TreeEvent::BranchDidUpdate);
        assert_eq!(watcher.subscriber_count(), 0);
    }

    #[test]
    fn events_arrive_in_dispatch_order() {
        let mut watcher = TreeWatcher::new();
        let mut rx = watcher.subscribe();
        watcher.notify(TreeEvent::WillResolveChildren { id: NodeId(1) });
        watcher.notify(TreeEvent::DidResolveChildren { id: NodeId(1) });
        assert!(matches!(
            rx.try_recv(),
            Ok(TreeEvent::WillResolveChildren { .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(TreeEvent::DidResolveChildren { .. })
        ));
    }
}
