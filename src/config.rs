//! Demo-binary configuration: TOML file loading, CLI overrides, defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--config`, `--show-hidden`, ...)
//! 2. `$FLATBRANCH_CONFIG` environment variable (path to config file)
//! 3. Project-local `.flatbranch.toml` in the current working directory
//! 4. Global `~/.config/flatbranch/config.toml`
//! 5. Built-in defaults

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Tree listing settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TreeConfig {
    /// Include dotfiles in the tree.
    pub show_hidden: Option<bool>,
}

/// Filesystem watcher settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Enable the filesystem watcher (`--watch` still has to be passed).
    pub enabled: Option<bool>,
    /// Debounce window in milliseconds.
    pub debounce_ms: Option<u64>,
    /// Batch size above which changes collapse into one root refresh.
    pub flood_threshold: Option<usize>,
}

/// Expansion/scroll state persistence.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    /// File the serialized tree state is saved to and restored from.
    pub file: Option<String>,
}

/// Top-level configuration.
///
/// All fields are optional so partial configs from different sources can be
/// merged (CLI overrides file, file overrides defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tree: TreeConfig,
    pub watcher: WatcherConfig,
    pub state: StateConfig,
}

/// Candidate config file paths in priority order (highest first). The CLI
/// `--config` path is handled separately.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(env_path) = std::env::var("FLATBRANCH_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".flatbranch.toml"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("flatbranch").join("config.toml"));
    }
    paths
}

/// Read and parse one TOML config file. `None` when missing or unparsable
/// (with a warning on stderr for the latter).
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<AppConfig>(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!(
                "Warning: failed to parse config file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

impl AppConfig {
    /// Merge `other` on top of `self` — `other`'s `Some` values win.
    pub fn merge(self, other: &AppConfig) -> AppConfig {
        AppConfig {
            tree: TreeConfig {
                show_hidden: other.tree.show_hidden.or(self.tree.show_hidden),
            },
            watcher: WatcherConfig {
                enabled: other.watcher.enabled.or(self.watcher.enabled),
                debounce_ms: other.watcher.debounce_ms.or(self.watcher.debounce_ms),
                flood_threshold: other
                    .watcher
                    .flood_threshold
                    .or(self.watcher.flood_threshold),
            },
            state: StateConfig {
                file: other.state.file.clone().or(self.state.file),
            },
        }
    }

    /// Load the final merged configuration.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&AppConfig>) -> AppConfig {
        let mut config = AppConfig::default();
        // Lowest priority first so later merges overwrite.
        for path in candidate_paths().iter().rev() {
            if let Some(file_config) = load_file(path) {
                config = config.merge(&file_config);
            }
        }
        if let Some(cli_path) = cli_config_path {
            if let Some(file_config) = load_file(cli_path) {
                config = config.merge(&file_config);
            }
        }
        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }
        config
    }

    // Convenience getters with built-in defaults.

    pub fn show_hidden(&self) -> bool {
        self.tree.show_hidden.unwrap_or(false)
    }

    pub fn watcher_enabled(&self) -> bool {
        self.watcher.enabled.unwrap_or(true)
    }

    pub fn debounce_ms(&self) -> u64 {
        self.watcher
            .debounce_ms
            .unwrap_or(crate::fs::DEFAULT_DEBOUNCE_MS)
    }

    pub fn flood_threshold(&self) -> usize {
        self.watcher
            .flood_threshold
            .unwrap_or(crate::fs::DEFAULT_FLOOD_THRESHOLD)
    }

    pub fn state_file(&self) -> Option<&str> {
        self.state.file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = AppConfig::default();
        assert!(!config.show_hidden());
        assert!(config.watcher_enabled());
        assert_eq!(config.debounce_ms(), 300);
        assert_eq!(config.flood_threshold(), 100);
        assert!(config.state_file().is_none());
    }

    #[test]
    fn toml_parsing_full() {
        let toml = r#"
[tree]
show_hidden = true

[watcher]
enabled = false
debounce_ms = 500
flood_threshold = 42

[state]
file = "/tmp/tree-state.json"
"#;
        let config: AppConfig = toml::from_str(toml).expect("parse failed");
        assert!(config.show_hidden());
        assert!(!config.watcher_enabled());
        assert_eq!(config.debounce_ms(), 500);
        assert_eq!(config.flood_threshold(), 42);
        assert_eq!(config.state_file(), Some("/tmp/tree-state.json"));
    }

    #[test]
    fn toml_parsing_partial_keeps_defaults() {
        let toml = r#"
[tree]
show_hidden = true
"#;
        let config: AppConfig = toml::from_str(toml).expect("parse failed");
        assert!(config.show_hidden());
        assert!(config.watcher_enabled());
        assert_eq!(config.debounce_ms(), 300);
    }

    #[test]
    fn toml_parsing_empty() {
        let config: AppConfig = toml::from_str("").expect("parse failed");
        assert!(!config.show_hidden());
    }

    #[test]
    fn merge_overrides_only_set_values() {
        let base = AppConfig {
            tree: TreeConfig {
                show_hidden: Some(false),
            },
            watcher: WatcherConfig {
                debounce_ms: Some(500),
                ..Default::default()
            },
            ..Default::default()
        };
        let over = AppConfig {
            tree: TreeConfig {
                show_hidden: Some(true),
            },
            ..Default::default()
        };
        let merged = base.merge(&over);
        assert!(merged.show_hidden());
        assert_eq!(merged.debounce_ms(), 500);
    }

    #[test]
    fn merge_none_does_not_clear_some() {
        let base = AppConfig {
            state: StateConfig {
                file: Some("/tmp/s.json".into()),
            },
            ..Default::default()
        };
        let merged = base.merge(&AppConfig::default());
        assert_eq!(merged.state_file(), Some("/tmp/s.json"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[watcher]
debounce_ms = 750
"#,
        )
        .expect("write");
        let config = load_file(&path).expect("load");
        assert_eq!(config.debounce_ms(), 750);
        assert!(!config.show_hidden());
    }

    #[test]
    fn load_missing_file_is_none() {
        assert!(load_file(Path::new("/nonexistent/config.toml")).is_none());
    }

    #[test]
    fn load_invalid_toml_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is { not valid toml").expect("write");
        assert!(load_file(&path).is_none());
    }

    #[test]
    fn cli_overrides_beat_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tree]
show_hidden = false

[watcher]
debounce_ms = 500
"#,
        )
        .expect("write");
        let overrides = AppConfig {
            tree: TreeConfig {
                show_hidden: Some(true),
            },
            ..Default::default()
        };
        let config = AppConfig::load(Some(&path), Some(&overrides));
        assert!(config.show_hidden());
        assert_eq!(config.debounce_ms(), 500);
    }
}
