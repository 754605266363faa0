use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Version stamp written into every serialized snapshot.
pub const TREE_STATE_SPEC_VERSION: u32 = 1;

/// Expanded directory paths, relative to the tree root, split by whether
/// they currently contribute surface rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedDirectories {
    /// Expanded and reachable through the flattened surface.
    pub at_surface: Vec<String>,
    /// Expanded but hidden beneath a collapsed ancestor; restored lazily.
    pub buried: Vec<String>,
}

/// The persistable UI state of one tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializableTreeState {
    pub spec_version: u32,
    pub scroll_position: f64,
    pub expanded_directories: ExpandedDirectories,
}

impl Default for SerializableTreeState {
    fn default() -> Self {
        Self {
            spec_version: TREE_STATE_SPEC_VERSION,
            scroll_position: 0.0,
            expanded_directories: ExpandedDirectories::default(),
        }
    }
}

/// Receives a fresh snapshot whenever the tracked state changes.
///
/// Created by [`super::TreeStateManager::watch`]; `snapshot()` returns the
/// most recently delivered state, `poll()` drains pending updates.
pub struct TreeStateWatcher {
    rx: mpsc::UnboundedReceiver<SerializableTreeState>,
    last: SerializableTreeState,
}

impl TreeStateWatcher {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<SerializableTreeState>,
        initial: SerializableTreeState,
    ) -> Self {
        Self { rx, last: initial }
    }

    /// Drain pending updates; returns whether anything new arrived.
    pub fn poll(&mut self) -> bool {
        let mut updated = false;
        while let Ok(state) = self.rx.try_recv() {
            self.last = state;
            updated = true;
        }
        updated
    }

    /// Wait for the next update. `None` when the manager went away.
    pub async fn changed(&mut self) -> Option<SerializableTreeState> {
        let state = self.rx.recv().await?;
        self.last = state.clone();
        Some(state)
    }

    /// The most recently observed state.
    pub fn snapshot(&self) -> SerializableTreeState {
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_has_current_version() {
        let state = SerializableTreeState::default();
        assert_eq!(state.spec_version, TREE_STATE_SPEC_VERSION);
        assert_eq!(state.scroll_position, 0.0);
        assert!(state.expanded_directories.at_surface.is_empty());
    }

    #[test]
    fn schema_round_trips_through_json() {
        let state = SerializableTreeState {
            spec_version: TREE_STATE_SPEC_VERSION,
            scroll_position: 256.5,
            expanded_directories: ExpandedDirectories {
                at_surface: vec!["src".into(), "src/tree".into()],
                buried: vec!["target/debug".into()],
            },
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"specVersion\":1"));
        assert!(json.contains("\"scrollPosition\":256.5"));
        assert!(json.contains("\"atSurface\""));
        assert!(json.contains("\"buried\""));
        let back: SerializableTreeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn watcher_tracks_latest_snapshot() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = TreeStateWatcher::new(rx, SerializableTreeState::default());
        assert!(!watcher.poll());

        let mut next = SerializableTreeState::default();
        next.scroll_position = 10.0;
        tx.send(next.clone()).unwrap();
        assert!(watcher.poll());
        assert_eq!(watcher.snapshot(), next);
    }
}
