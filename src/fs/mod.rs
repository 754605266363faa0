//! Filesystem host adapter: a directory-backed children resolver and a
//! debounced change watcher. The engine itself is storage-agnostic; this
//! module is what the demo binary (and tests) plug into it.

mod resolver;
mod watcher;

pub use resolver::FsTreeResolver;
pub use watcher::{
    should_ignore, FsWatcher, FsWatcherConfig, DEFAULT_DEBOUNCE_MS, DEFAULT_FLOOD_THRESHOLD,
    DEFAULT_IGNORE_PATTERNS,
};
