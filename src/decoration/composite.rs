use std::collections::HashSet;

use super::decoration::DecorationId;

/// The two composite slots every decorated node carries: `Applicable` is
/// what the node's own row renders, `Inheritable` is what it hands down to
/// descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Applicable,
    Inheritable,
}

/// One composite slot. `owned: None` means the slot aliases the nearest
/// self-owned ancestor's inheritable slot (the copy-on-write default);
/// a direct target or negation diverges it into `Some`.
#[derive(Debug, Default)]
pub(crate) struct Composite {
    pub(crate) owned: Option<OwnedState>,
}

impl Composite {
    pub(crate) fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    /// Diverge into self-owned state (idempotent).
    pub(crate) fn own(&mut self) -> &mut OwnedState {
        self.owned.get_or_insert_with(OwnedState::default)
    }

    /// Revert to aliasing the parent when no direct entries remain.
    pub(crate) fn maybe_release(&mut self) {
        if self
            .owned
            .as_ref()
            .is_some_and(|o| o.targeted.is_empty() && o.negated.is_empty())
        {
            self.owned = None;
        }
    }
}

/// Self-owned composite state: the directly targeted/negated decorations and
/// the computed render set with its flattened class list.
#[derive(Debug, Default)]
pub(crate) struct OwnedState {
    pub(crate) targeted: HashSet<DecorationId>,
    pub(crate) negated: HashSet<DecorationId>,
    /// Effective decorations in render order: inherited first, then direct
    /// targets by id.
    pub(crate) rendered: Vec<DecorationId>,
    /// Flattened class labels of the enabled rendered decorations.
    pub(crate) classlist: Vec<String>,
}

/// Per-node composite pair.
#[derive(Debug, Default)]
pub(crate) struct NodeComposites {
    pub(crate) applicable: Composite,
    pub(crate) inheritable: Composite,
}

impl NodeComposites {
    pub(crate) fn slot_mut(&mut self, kind: CompositeKind) -> &mut Composite {
        match kind {
            CompositeKind::Applicable => &mut self.applicable,
            CompositeKind::Inheritable => &mut self.inheritable,
        }
    }

    pub(crate) fn slot(&self, kind: CompositeKind) -> &Composite {
        match kind {
            CompositeKind::Applicable => &self.applicable,
            CompositeKind::Inheritable => &self.inheritable,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.applicable.is_owned() && !self.inheritable.is_owned()
    }
}

/// Read-only snapshot of a node's decoration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecorationData {
    /// Whether either composite slot has diverged from its parent.
    pub self_owned: bool,
    /// Classes the node's own row renders.
    pub applicable: Vec<String>,
    /// Classes the node hands down to aliasing descendants.
    pub inheritable: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_composite_aliases_parent() {
        let c = Composite::default();
        assert!(!c.is_owned());
    }

    #[test]
    fn own_then_release_round_trip() {
        let mut c = Composite::default();
        c.own().targeted.insert(DecorationId(1));
        assert!(c.is_owned());
        c.maybe_release();
        assert!(c.is_owned(), "non-empty state must not release");
        c.own().targeted.clear();
        c.maybe_release();
        assert!(!c.is_owned());
    }
}
