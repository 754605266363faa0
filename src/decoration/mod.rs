//! Visual decoration composition.
//!
//! A [`Decoration`] is a named tag carrying CSS-class-like labels plus
//! registries of the nodes it targets or negates. The [`DecorationsManager`]
//! owns every decoration and the per-node composite state, and is the only
//! mutation path, so class-list reads stay consistent with the tree.
//!
//! Composite state is copy-on-write: a node with no direct target or
//! negation aliases its nearest decorated ancestor and costs nothing; the
//! first direct mutation diverges it into self-owned state.

mod composite;
mod decoration;
mod manager;

pub use composite::{CompositeKind, DecorationData};
pub use decoration::{Decoration, DecorationId, TargetMatchMode};
pub use manager::{DecorationChange, DecorationsManager};
