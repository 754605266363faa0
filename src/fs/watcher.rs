use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use tokio::sync::mpsc;
use tracing::debug;

/// Directory names dropped from watch batches by default.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
];

/// Default debounce window in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Events per window above which a batch collapses into one root refresh.
pub const DEFAULT_FLOOD_THRESHOLD: usize = 100;

/// Tunables for [`FsWatcher`].
pub struct FsWatcherConfig {
    pub debounce: Duration,
    pub ignore_patterns: Vec<String>,
    pub flood_threshold: usize,
}

impl Default for FsWatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            flood_threshold: DEFAULT_FLOOD_THRESHOLD,
        }
    }
}

/// Debounced recursive filesystem watcher.
///
/// Each debounce window yields one batch of changed paths on the channel.
/// Ignored components are filtered out, and a batch larger than the flood
/// threshold collapses to just the root path — the receiver treats that as
/// "refresh everything". Dropping the watcher stops watching.
pub struct FsWatcher {
    active: Arc<AtomicBool>,
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl FsWatcher {
    /// Watch `root` recursively, sending debounced path batches to `tx`.
    pub fn new(
        root: &Path,
        config: FsWatcherConfig,
        tx: mpsc::UnboundedSender<Vec<PathBuf>>,
    ) -> notify::Result<Self> {
        let active = Arc::new(AtomicBool::new(true));
        let forward = active.clone();
        let root_path = root.to_path_buf();
        let FsWatcherConfig {
            debounce,
            ignore_patterns,
            flood_threshold,
        } = config;

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                if !forward.load(Ordering::Relaxed) {
                    return;
                }
                let events = match result {
                    Ok(events) => events,
                    Err(error) => {
                        // Watcher errors are non-fatal; the tree just stops
                        // hearing about changes until the next batch.
                        debug!(%error, "filesystem watcher error");
                        return;
                    }
                };
                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .map(|e| e.path)
                    .filter(|p| !should_ignore(p, &ignore_patterns))
                    .collect();
                if paths.is_empty() {
                    return;
                }
                let batch = if paths.len() > flood_threshold {
                    vec![root_path.clone()]
                } else {
                    paths
                };
                let _ = tx.send(batch);
            },
        )?;
        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        Ok(Self {
            active,
            _debouncer: debouncer,
        })
    }

    /// Stop forwarding batches; the underlying watches stay registered so
    /// resuming is cheap.
    pub fn pause(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Whether any path component matches an ignore pattern exactly.
pub fn should_ignore(path: &Path, patterns: &[String]) -> bool {
    path.components().any(|component| {
        matches!(
            component,
            std::path::Component::Normal(name)
                if patterns.iter().any(|p| name.to_string_lossy() == *p)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn ignores_matching_components_at_any_depth() {
        let pats = patterns(&[".git", "node_modules"]);
        assert!(should_ignore(Path::new("/p/.git/HEAD"), &pats));
        assert!(should_ignore(
            Path::new("/p/a/node_modules/x/index.js"),
            &pats
        ));
        assert!(!should_ignore(Path::new("/p/src/main.rs"), &pats));
    }

    #[test]
    fn requires_exact_component_match() {
        let pats = patterns(&["target"]);
        assert!(should_ignore(Path::new("/p/target/debug/bin"), &pats));
        assert!(!should_ignore(Path::new("/p/target2/file.txt"), &pats));
        assert!(!should_ignore(Path::new("/p/my-target/file.txt"), &pats));
    }

    #[test]
    fn empty_patterns_ignore_nothing() {
        assert!(!should_ignore(Path::new("/p/.git/HEAD"), &[]));
    }

    #[test]
    fn default_config_carries_standard_ignores() {
        let config = FsWatcherConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        assert_eq!(config.flood_threshold, DEFAULT_FLOOD_THRESHOLD);
        assert!(config.ignore_patterns.iter().any(|p| p == ".git"));
    }

    #[test]
    fn flood_threshold_collapses_to_root() {
        let paths: Vec<PathBuf> = (0..200)
            .map(|i| PathBuf::from(format!("/tmp/file_{i}")))
            .collect();
        let root = PathBuf::from("/tmp");
        let batch = if paths.len() > DEFAULT_FLOOD_THRESHOLD {
            vec![root.clone()]
        } else {
            paths
        };
        assert_eq!(batch, vec![root]);
    }

    #[test]
    fn below_flood_threshold_keeps_individual_paths() {
        let paths: Vec<PathBuf> = (0..50)
            .map(|i| PathBuf::from(format!("/tmp/file_{i}")))
            .collect();
        let batch = if paths.len() > DEFAULT_FLOOD_THRESHOLD {
            vec![PathBuf::from("/tmp")]
        } else {
            paths
        };
        assert_eq!(batch.len(), 50);
    }
}
