use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use super::composite::{CompositeKind, DecorationData, NodeComposites};
use super::decoration::{Decoration, DecorationId, TargetMatchMode};
use crate::event::TreeEvent;
use crate::tree::node::NodeId;
use crate::tree::Tree;

const KINDS: [CompositeKind; 2] = [CompositeKind::Applicable, CompositeKind::Inheritable];

fn covers(mode: TargetMatchMode, kind: CompositeKind) -> bool {
    match kind {
        CompositeKind::Applicable => mode.covers_self(),
        CompositeKind::Inheritable => mode.covers_children(),
    }
}

/// A row whose class list changed; renderers repaint just that row.
#[derive(Debug, Clone, Copy)]
pub struct DecorationChange {
    pub node: NodeId,
}

/// Binds decorations to tree nodes and keeps per-node composite class lists
/// current.
///
/// All decoration mutation funnels through here: target registries and the
/// copy-on-write composite slots stay in lockstep, and every visible class
/// change is announced per affected row, never as a whole-tree invalidation.
#[derive(Default)]
pub struct DecorationsManager {
    decorations: HashMap<DecorationId, Decoration>,
    next_id: u64,
    composites: HashMap<NodeId, NodeComposites>,
    senders: Vec<mpsc::UnboundedSender<DecorationChange>>,
}

impl DecorationsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoration and take ownership of it.
    pub fn register(&mut self, decoration: Decoration) -> DecorationId {
        let id = DecorationId(self.next_id);
        self.next_id += 1;
        self.decorations.insert(id, decoration);
        id
    }

    /// Remove a decoration; every node that rendered it is refreshed.
    pub fn unregister(&mut self, tree: &Tree, id: DecorationId) {
        let Some(decoration) = self.decorations.remove(&id) else {
            return;
        };
        let mut affected: HashSet<NodeId> = decoration.applied_targets.keys().copied().collect();
        affected.extend(decoration.negated_targets.keys().copied());
        for node in &affected {
            if let Some(entry) = self.composites.get_mut(node) {
                for kind in KINDS {
                    let slot = entry.slot_mut(kind);
                    if let Some(owned) = slot.owned.as_mut() {
                        owned.targeted.remove(&id);
                        owned.negated.remove(&id);
                    }
                    slot.maybe_release();
                }
                if entry.is_empty() {
                    self.composites.remove(node);
                }
            }
        }
        for node in affected {
            self.refresh_from(tree, node, true);
        }
    }

    pub fn decoration(&self, id: DecorationId) -> Option<&Decoration> {
        self.decorations.get(&id)
    }

    /// Subscribe to per-row class-list change notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DecorationChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    // ── Targeting ───────────────────────────────────────────────────────────

    /// Apply `decoration` at `node` with the given reach. The first direct
    /// target diverges the node's composite state from its parent.
    pub fn add_target(
        &mut self,
        tree: &Tree,
        decoration: DecorationId,
        node: NodeId,
        mode: TargetMatchMode,
    ) {
        let Some(d) = self.decorations.get_mut(&decoration) else {
            return;
        };
        let old = d.applied_targets.insert(node, mode);
        if old == Some(mode) {
            return;
        }
        self.apply_registry_change(node, decoration, old, Some(mode), false);
        self.refresh_from(tree, node, false);
    }

    /// Withdraw a direct target. When the node's last direct entry goes, its
    /// composite state reverts to aliasing the parent.
    pub fn remove_target(&mut self, tree: &Tree, decoration: DecorationId, node: NodeId) {
        let Some(d) = self.decorations.get_mut(&decoration) else {
            return;
        };
        let Some(old) = d.applied_targets.remove(&node) else {
            return;
        };
        self.apply_registry_change(node, decoration, Some(old), None, false);
        // The node may have reverted to aliasing its parent, leaving no
        // state to diff against; force the downstream re-announcement.
        self.refresh_from(tree, node, true);
    }

    /// Suppress an otherwise-inherited decoration at `node` (and, depending
    /// on `mode`, below it) without touching the ancestors that carry it.
    pub fn negate_target(
        &mut self,
        tree: &Tree,
        decoration: DecorationId,
        node: NodeId,
        mode: TargetMatchMode,
    ) {
        let Some(d) = self.decorations.get_mut(&decoration) else {
            return;
        };
        let old = d.negated_targets.insert(node, mode);
        if old == Some(mode) {
            return;
        }
        self.apply_registry_change(node, decoration, old, Some(mode), true);
        self.refresh_from(tree, node, false);
    }

    pub fn un_negate_target(&mut self, tree: &Tree, decoration: DecorationId, node: NodeId) {
        let Some(d) = self.decorations.get_mut(&decoration) else {
            return;
        };
        let Some(old) = d.negated_targets.remove(&node) else {
            return;
        };
        self.apply_registry_change(node, decoration, Some(old), None, true);
        self.refresh_from(tree, node, true);
    }

    /// Sync the composite slots of `node` with a registry transition
    /// `old → new` for one decoration.
    fn apply_registry_change(
        &mut self,
        node: NodeId,
        decoration: DecorationId,
        old: Option<TargetMatchMode>,
        new: Option<TargetMatchMode>,
        negation: bool,
    ) {
        let entry = self.composites.entry(node).or_default();
        for kind in KINDS {
            let was = old.is_some_and(|m| covers(m, kind));
            let is = new.is_some_and(|m| covers(m, kind));
            if is && !was {
                let owned = entry.slot_mut(kind).own();
                if negation {
                    owned.negated.insert(decoration);
                } else {
                    owned.targeted.insert(decoration);
                }
            } else if was && !is {
                let slot = entry.slot_mut(kind);
                if let Some(owned) = slot.owned.as_mut() {
                    if negation {
                        owned.negated.remove(&decoration);
                    } else {
                        owned.targeted.remove(&decoration);
                    }
                }
                slot.maybe_release();
            }
        }
        if entry.is_empty() {
            self.composites.remove(&node);
        }
    }

    // ── Decoration mutation ─────────────────────────────────────────────────

    pub fn add_css_class(&mut self, tree: &Tree, id: DecorationId, class: impl Into<String>) {
        let class = class.into();
        let Some(d) = self.decorations.get_mut(&id) else {
            return;
        };
        if d.css_classes.contains(&class) {
            return;
        }
        d.css_classes.push(class);
        self.refresh_targets_of(tree, id);
    }

    pub fn remove_css_class(&mut self, tree: &Tree, id: DecorationId, class: &str) {
        let Some(d) = self.decorations.get_mut(&id) else {
            return;
        };
        let before = d.css_classes.len();
        d.css_classes.retain(|c| c != class);
        if d.css_classes.len() != before {
            self.refresh_targets_of(tree, id);
        }
    }

    pub fn set_disabled(&mut self, tree: &Tree, id: DecorationId, disabled: bool) {
        let Some(d) = self.decorations.get_mut(&id) else {
            return;
        };
        if d.disabled == disabled {
            return;
        }
        d.disabled = disabled;
        self.refresh_targets_of(tree, id);
    }

    fn refresh_targets_of(&mut self, tree: &Tree, id: DecorationId) {
        let targets: Vec<NodeId> = self
            .decorations
            .get(&id)
            .map(|d| d.applied_targets.keys().copied().collect())
            .unwrap_or_default();
        for node in targets {
            self.refresh_from(tree, node, false);
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// The class list the node's row should render right now.
    pub fn classlist(&self, tree: &Tree, node: NodeId) -> Vec<String> {
        if let Some(entry) = self.composites.get(&node) {
            if let Some(owned) = entry.applicable.owned.as_ref() {
                return owned.classlist.clone();
            }
        }
        self.inherited_classlist(tree, node)
    }

    /// Snapshot of a node's composite state.
    pub fn decoration_data(&self, tree: &Tree, node: NodeId) -> DecorationData {
        let self_owned = self
            .composites
            .get(&node)
            .is_some_and(|e| e.applicable.is_owned() || e.inheritable.is_owned());
        DecorationData {
            self_owned,
            applicable: self.classlist(tree, node),
            inheritable: self.effective_inheritable_classes(tree, node),
        }
    }

    fn effective_inheritable_classes(&self, tree: &Tree, node: NodeId) -> Vec<String> {
        if let Some(entry) = self.composites.get(&node) {
            if let Some(owned) = entry.inheritable.owned.as_ref() {
                return owned.classlist.clone();
            }
        }
        self.inherited_classlist(tree, node)
    }

    fn inherited_classlist(&self, tree: &Tree, node: NodeId) -> Vec<String> {
        let mut cur = tree.node(node).and_then(|n| n.parent());
        while let Some(pid) = cur {
            if let Some(entry) = self.composites.get(&pid) {
                if let Some(owned) = entry.inheritable.owned.as_ref() {
                    return owned.classlist.clone();
                }
            }
            cur = tree.node(pid).and_then(|n| n.parent());
        }
        Vec::new()
    }

    fn inherited_rendered(&self, tree: &Tree, node: NodeId) -> Vec<DecorationId> {
        let mut cur = tree.node(node).and_then(|n| n.parent());
        while let Some(pid) = cur {
            if let Some(entry) = self.composites.get(&pid) {
                if let Some(owned) = entry.inheritable.owned.as_ref() {
                    return owned.rendered.clone();
                }
            }
            cur = tree.node(pid).and_then(|n| n.parent());
        }
        Vec::new()
    }

    // ── Tree integration ────────────────────────────────────────────────────

    /// Feed structural tree events in. Re-parenting re-derives the moved
    /// subtree's composite state under its new ancestors; disposal drops the
    /// node from every registry.
    pub fn handle_tree_event(&mut self, tree: &Tree, event: &TreeEvent) {
        match event {
            TreeEvent::DidChangeParent { id, .. } => {
                self.refresh_from(tree, *id, true);
            }
            TreeEvent::DidDispose { id, .. } => {
                self.composites.remove(id);
                for d in self.decorations.values_mut() {
                    d.applied_targets.remove(id);
                    d.negated_targets.remove(id);
                }
            }
            _ => {}
        }
    }

    // ── Recomputation ───────────────────────────────────────────────────────

    /// Recompute the subtree rooted at `node`. `parent_changed` marks that
    /// the inherited state above `node` differs from what descendants last
    /// saw, which forces aliasing rows to re-announce.
    fn refresh_from(&mut self, tree: &Tree, node: NodeId, parent_changed: bool) {
        let child_flag = self.refresh_node(tree, node, parent_changed);
        let children: Vec<NodeId> = tree
            .node(node)
            .and_then(|n| n.children())
            .map(<[NodeId]>::to_vec)
            .unwrap_or_default();
        for child in children {
            self.refresh_from(tree, child, child_flag);
        }
    }

    /// Recompute one node's owned slots. Returns whether the state this node
    /// hands down to descendants changed.
    fn refresh_node(&mut self, tree: &Tree, node: NodeId, parent_changed: bool) -> bool {
        if !self.composites.contains_key(&node) {
            if parent_changed {
                self.notify(node);
            }
            return parent_changed;
        }
        let mut row_changed = false;
        let mut inherit_changed = parent_changed;
        for kind in KINDS {
            let is_owned = self
                .composites
                .get(&node)
                .is_some_and(|e| e.slot(kind).is_owned());
            let changed = if is_owned {
                let (rendered, classlist) = self.compute(tree, node, kind);
                let entry = self.composites.get_mut(&node).expect("entry exists");
                let owned = entry.slot_mut(kind).owned.as_mut().expect("slot owned");
                let changed = owned.rendered != rendered || owned.classlist != classlist;
                owned.rendered = rendered;
                owned.classlist = classlist;
                changed
            } else {
                parent_changed
            };
            match kind {
                CompositeKind::Applicable => row_changed = changed,
                CompositeKind::Inheritable => inherit_changed = changed,
            }
        }
        if row_changed {
            self.notify(node);
        }
        inherit_changed
    }

    /// Effective render set for one owned slot: inherited decorations first
    /// (minus negations), then direct targets in id order.
    fn compute(
        &self,
        tree: &Tree,
        node: NodeId,
        kind: CompositeKind,
    ) -> (Vec<DecorationId>, Vec<String>) {
        let inherited = self.inherited_rendered(tree, node);
        let Some(owned) = self
            .composites
            .get(&node)
            .and_then(|e| e.slot(kind).owned.as_ref())
        else {
            return (Vec::new(), Vec::new());
        };
        let mut rendered = Vec::new();
        for d in inherited {
            if !owned.negated.contains(&d) && !rendered.contains(&d) {
                rendered.push(d);
            }
        }
        let mut direct: Vec<DecorationId> = owned.targeted.iter().copied().collect();
        direct.sort();
        for d in direct {
            if !owned.negated.contains(&d) && !rendered.contains(&d) {
                rendered.push(d);
            }
        }
        let classlist = rendered
            .iter()
            .filter_map(|d| self.decorations.get(d))
            .filter(|d| !d.disabled)
            .flat_map(|d| d.css_classes.iter().cloned())
            .collect();
        (rendered, classlist)
    }

    fn notify(&mut self, node: NodeId) {
        self.senders
            .retain(|tx| tx.send(DecorationChange { node }).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::tree::node::NodeItem;
    use crate::tree::{ResolveContext, TreeResolver};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MapResolver {
        map: Mutex<HashMap<String, Vec<NodeItem>>>,
    }

    impl MapResolver {
        fn set(&self, relative: &str, items: Vec<NodeItem>) {
            self.map.lock().unwrap().insert(relative.to_string(), items);
        }
    }

    #[async_trait]
    impl TreeResolver for MapResolver {
        async fn resolve_children(
            &self,
            parent: &ResolveContext,
        ) -> Result<Option<Vec<NodeItem>>> {
            Ok(self.map.lock().unwrap().get(&parent.relative_path).cloned())
        }
    }

    /// root → a (expanded) → [b, c (expanded) → d]
    async fn sample_tree() -> Tree {
        let resolver = Arc::new(MapResolver::default());
        resolver.set("", vec![NodeItem::composite("a")]);
        resolver.set(
            "a",
            vec![NodeItem::leaf("b"), NodeItem::composite("c")],
        );
        resolver.set("a/c", vec![NodeItem::leaf("d")]);
        let mut tree = Tree::new(resolver as Arc<dyn TreeResolver>);
        let root = tree.root_id();
        tree.ensure_loaded(root).await.unwrap();
        let a = tree.node_by_path("a").unwrap().id();
        tree.set_expanded(a, true, false).await.unwrap();
        let c = tree.node_by_path("a/c").unwrap().id();
        tree.set_expanded(c, true, false).await.unwrap();
        tree
    }

    fn ids(tree: &Tree) -> (NodeId, NodeId, NodeId, NodeId) {
        (
            tree.node_by_path("a").unwrap().id(),
            tree.node_by_path("a/b").unwrap().id(),
            tree.node_by_path("a/c").unwrap().id(),
            tree.node_by_path("a/c/d").unwrap().id(),
        )
    }

    #[tokio::test]
    async fn self_only_decorates_a_single_row() {
        let tree = sample_tree().await;
        let (a, b, _, _) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let sel = manager.register(Decoration::new("selected").with_class("mod-selected"));
        manager.add_target(&tree, sel, a, TargetMatchMode::SelfOnly);

        assert_eq!(manager.classlist(&tree, a), ["mod-selected"]);
        assert!(manager.classlist(&tree, b).is_empty());
        assert!(manager.decoration_data(&tree, a).self_owned);
        assert!(!manager.decoration_data(&tree, b).self_owned);
    }

    #[tokio::test]
    async fn self_and_children_inherits_to_descendants() {
        let tree = sample_tree().await;
        let (a, b, c, d) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);

        for node in [a, b, c, d] {
            assert_eq!(manager.classlist(&tree, node), ["mod-dimmed"]);
        }
        // Descendants alias the ancestor's state; only `a` diverged.
        assert!(!manager.decoration_data(&tree, c).self_owned);
    }

    #[tokio::test]
    async fn children_mode_skips_the_targeted_row() {
        let tree = sample_tree().await;
        let (a, b, c, d) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let mark = manager.register(Decoration::new("mark").with_class("mod-mark"));
        manager.add_target(&tree, mark, a, TargetMatchMode::Children);

        assert!(manager.classlist(&tree, a).is_empty());
        for node in [b, c, d] {
            assert_eq!(manager.classlist(&tree, node), ["mod-mark"]);
        }
    }

    #[tokio::test]
    async fn negation_suppresses_without_touching_ancestors() {
        let tree = sample_tree().await;
        let (a, b, c, d) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);
        manager.negate_target(&tree, dim, c, TargetMatchMode::SelfAndChildren);

        assert_eq!(manager.classlist(&tree, a), ["mod-dimmed"]);
        assert_eq!(manager.classlist(&tree, b), ["mod-dimmed"]);
        assert!(manager.classlist(&tree, c).is_empty());
        assert!(manager.classlist(&tree, d).is_empty());

        manager.un_negate_target(&tree, dim, c);
        assert_eq!(manager.classlist(&tree, c), ["mod-dimmed"]);
        assert_eq!(manager.classlist(&tree, d), ["mod-dimmed"]);
    }

    #[tokio::test]
    async fn direct_target_diverges_and_keeps_inherited_classes() {
        let tree = sample_tree().await;
        let (a, _, c, d) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        let cut = manager.register(Decoration::new("cut").with_class("mod-cut"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);
        manager.add_target(&tree, cut, c, TargetMatchMode::SelfOnly);

        assert_eq!(manager.classlist(&tree, c), ["mod-dimmed", "mod-cut"]);
        // The divergence is self-only; d keeps inheriting from a through c.
        assert_eq!(manager.classlist(&tree, d), ["mod-dimmed"]);
        assert!(manager.decoration_data(&tree, c).self_owned);
    }

    #[tokio::test]
    async fn removing_last_direct_entry_reverts_to_parent() {
        let tree = sample_tree().await;
        let (a, _, c, _) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        let cut = manager.register(Decoration::new("cut").with_class("mod-cut"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);
        manager.add_target(&tree, cut, c, TargetMatchMode::SelfOnly);
        assert!(manager.decoration_data(&tree, c).self_owned);

        manager.remove_target(&tree, cut, c);
        assert!(!manager.decoration_data(&tree, c).self_owned);
        assert_eq!(manager.classlist(&tree, c), ["mod-dimmed"]);
    }

    #[tokio::test]
    async fn changes_notify_each_affected_row() {
        let tree = sample_tree().await;
        let (a, b, c, d) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let mut rx = manager.subscribe();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);

        let mut notified = HashSet::new();
        while let Ok(change) = rx.try_recv() {
            notified.insert(change.node);
        }
        for node in [a, b, c, d] {
            assert!(notified.contains(&node), "missing notification for {node}");
        }
        assert!(!notified.contains(&tree.root_id()));
    }

    #[tokio::test]
    async fn disabled_decoration_contributes_no_classes() {
        let tree = sample_tree().await;
        let (a, _, _, _) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfOnly);

        manager.set_disabled(&tree, dim, true);
        assert!(manager.classlist(&tree, a).is_empty());
        manager.set_disabled(&tree, dim, false);
        assert_eq!(manager.classlist(&tree, a), ["mod-dimmed"]);
    }

    #[tokio::test]
    async fn class_mutations_propagate_to_inheritors() {
        let tree = sample_tree().await;
        let (a, b, _, _) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);

        manager.add_css_class(&tree, dim, "mod-faded");
        assert_eq!(manager.classlist(&tree, b), ["mod-dimmed", "mod-faded"]);
        manager.remove_css_class(&tree, dim, "mod-dimmed");
        assert_eq!(manager.classlist(&tree, b), ["mod-faded"]);
    }

    #[tokio::test]
    async fn reparenting_rederives_inherited_state() {
        let resolver = Arc::new(MapResolver::default());
        resolver.set(
            "",
            vec![NodeItem::composite("x"), NodeItem::composite("y")],
        );
        resolver.set("x", vec![NodeItem::leaf("f")]);
        resolver.set("y", Vec::new());
        let mut tree = Tree::new(resolver as Arc<dyn TreeResolver>);
        let root = tree.root_id();
        tree.ensure_loaded(root).await.unwrap();
        let x = tree.node_by_path("x").unwrap().id();
        let y = tree.node_by_path("y").unwrap().id();
        tree.set_expanded(x, true, false).await.unwrap();
        tree.set_expanded(y, true, false).await.unwrap();
        let f = tree.node_by_path("x/f").unwrap().id();

        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, x, TargetMatchMode::SelfAndChildren);
        assert_eq!(manager.classlist(&tree, f), ["mod-dimmed"]);

        let mut events = tree.subscribe();
        tree.mv(f, Some(y), None).unwrap();
        while let Ok(event) = events.try_recv() {
            manager.handle_tree_event(&tree, &event);
        }
        assert!(manager.classlist(&tree, f).is_empty());
    }

    #[tokio::test]
    async fn unregister_clears_rendered_classes() {
        let tree = sample_tree().await;
        let (a, b, _, _) = ids(&tree);
        let mut manager = DecorationsManager::new();
        let dim = manager.register(Decoration::new("dimmed").with_class("mod-dimmed"));
        manager.add_target(&tree, dim, a, TargetMatchMode::SelfAndChildren);
        assert_eq!(manager.classlist(&tree, b), ["mod-dimmed"]);

        manager.unregister(&tree, dim);
        assert!(manager.classlist(&tree, a).is_empty());
        assert!(manager.classlist(&tree, b).is_empty());
        assert!(manager.decoration(dim).is_none());
    }
}
