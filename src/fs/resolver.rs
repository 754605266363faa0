use std::collections::HashMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::tree::node::{NodeItem, NodeKind};
use crate::tree::{ResolveContext, TreeResolver};

/// Lazy directory-backed resolver: each tree composite maps to the
/// directory at the same root-relative path.
///
/// Unreadable entries are silently skipped; an unreadable directory
/// surfaces as an I/O error, which the tree degrades to an empty child
/// list.
pub struct FsTreeResolver {
    root: PathBuf,
    show_hidden: bool,
}

impl FsTreeResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            show_hidden: false,
        }
    }

    /// Include dotfiles in resolved children.
    pub fn show_hidden(mut self, show: bool) -> Self {
        self.show_hidden = show;
        self
    }
}

#[async_trait]
impl TreeResolver for FsTreeResolver {
    async fn resolve_children(&self, parent: &ResolveContext) -> Result<Option<Vec<NodeItem>>> {
        let dir = if parent.relative_path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&parent.relative_path)
        };
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let hidden = name.starts_with('.');
            if hidden && !self.show_hidden {
                continue;
            }
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let kind = if file_type.is_dir() {
                NodeKind::Composite
            } else {
                NodeKind::Leaf
            };
            let mut metadata = HashMap::new();
            metadata.insert("hidden".to_string(), Value::Bool(hidden));
            metadata.insert("symlink".to_string(), Value::Bool(file_type.is_symlink()));
            if let Ok(meta) = entry.metadata().await {
                metadata.insert("size".to_string(), Value::from(meta.len()));
                if let Ok(modified) = meta.modified() {
                    if let Ok(epoch) = modified.duration_since(UNIX_EPOCH) {
                        metadata.insert("modified".to_string(), Value::from(epoch.as_secs()));
                    }
                }
            }
            items.push(NodeItem {
                name,
                kind,
                metadata,
            });
        }
        Ok(Some(items))
    }
}
