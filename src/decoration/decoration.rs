use std::collections::HashMap;
use std::fmt;

use crate::tree::node::NodeId;

/// Handle to a decoration registered with a [`super::DecorationsManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecorationId(pub u64);

impl fmt::Display for DecorationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a target (or negation) applies relative to the targeted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMatchMode {
    /// The node itself only.
    SelfOnly,
    /// Descendants only, not the node itself.
    Children,
    /// The node and its descendants.
    SelfAndChildren,
}

impl TargetMatchMode {
    /// Whether this mode reaches the node's own row.
    pub fn covers_self(self) -> bool {
        matches!(self, Self::SelfOnly | Self::SelfAndChildren)
    }

    /// Whether this mode reaches the node's descendants.
    pub fn covers_children(self) -> bool {
        matches!(self, Self::Children | Self::SelfAndChildren)
    }
}

/// A named visual tag: an ordered list of class labels plus the registries of
/// targeted and negated nodes.
///
/// Construction is builder-style; after registration, all mutation goes
/// through the manager so dependent class lists are kept current.
#[derive(Debug, Default)]
pub struct Decoration {
    pub(crate) name: String,
    pub(crate) css_classes: Vec<String>,
    pub(crate) disabled: bool,
    pub(crate) applied_targets: HashMap<NodeId, TargetMatchMode>,
    pub(crate) negated_targets: HashMap<NodeId, TargetMatchMode>,
}

impl Decoration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.css_classes.push(class.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn css_classes(&self) -> &[String] {
        &self.css_classes
    }

    /// A disabled decoration keeps its targets but contributes no classes.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn applied_targets(&self) -> &HashMap<NodeId, TargetMatchMode> {
        &self.applied_targets
    }

    pub fn negated_targets(&self) -> &HashMap<NodeId, TargetMatchMode> {
        &self.negated_targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_classes() {
        let deco = Decoration::new("selected")
            .with_class("mod-selected")
            .with_class("mod-focused");
        assert_eq!(deco.name(), "selected");
        assert_eq!(deco.css_classes(), ["mod-selected", "mod-focused"]);
        assert!(!deco.is_disabled());
    }

    #[test]
    fn match_mode_coverage() {
        assert!(TargetMatchMode::SelfOnly.covers_self());
        assert!(!TargetMatchMode::SelfOnly.covers_children());
        assert!(!TargetMatchMode::Children.covers_self());
        assert!(TargetMatchMode::Children.covers_children());
        assert!(TargetMatchMode::SelfAndChildren.covers_self());
        assert!(TargetMatchMode::SelfAndChildren.covers_children());
    }
}
