use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use flatbranch::config::AppConfig;
use flatbranch::{
    Decoration, DecorationsManager, FsTreeResolver, FsWatcher, FsWatcherConfig, NodeId,
    SerializableTreeState, TargetMatchMode, Tree, TreeEvent, TreeStateManager, WatchEvent,
};

/// Browse a directory as a lazily-loaded tree and print its flattened
/// surface; optionally keep watching and reprinting on change.
#[derive(Parser, Debug)]
#[command(name = "fbt", version, about)]
struct Cli {
    /// Root directory to load (defaults to the current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Explicit config file (overrides the usual lookup)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Include dotfiles
    #[arg(long)]
    show_hidden: bool,

    /// Expand down to these root-relative paths before printing
    #[arg(long)]
    expand: Vec<String>,

    /// Expand every directory discovered so far
    #[arg(long)]
    expand_all: bool,

    /// Keep running, reprinting the surface on filesystem changes
    #[arg(long)]
    watch: bool,

    /// Save/restore expansion state from this file
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> flatbranch::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let overrides = AppConfig {
        tree: flatbranch::config::TreeConfig {
            show_hidden: cli.show_hidden.then_some(true),
        },
        ..AppConfig::default()
    };
    let config = AppConfig::load(cli.config.as_deref(), Some(&overrides));

    let root_path = cli.path.canonicalize()?;
    let root_name = root_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());

    let resolver = Arc::new(FsTreeResolver::new(&root_path).show_hidden(config.show_hidden()));
    let mut tree = Tree::named(resolver, &root_name);
    let mut events = tree.subscribe();
    let mut state = TreeStateManager::new();
    let mut decorations = DecorationsManager::new();
    let symlink_deco = decorations.register(Decoration::new("symlink").with_class("mod-symlink"));

    let root = tree.root_id();
    tree.ensure_loaded(root).await?;

    let state_file = cli
        .state
        .clone()
        .or_else(|| config.state_file().map(PathBuf::from));
    if let Some(path) = state_file.as_deref() {
        if let Some(saved) = read_state(path) {
            state.load_state(&mut tree, &saved).await?;
        }
    }
    for path in &cli.expand {
        tree.load_node_by_path(path).await?;
    }
    if cli.expand_all {
        tree.expand_all().await?;
    }

    pump_events(&mut events, &tree, &mut state, &mut decorations);
    decorate_symlinks(&tree, &mut decorations, symlink_deco);
    print_surface(&tree, &decorations);

    if cli.watch && config.watcher_enabled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher_config = FsWatcherConfig {
            debounce: Duration::from_millis(config.debounce_ms()),
            flood_threshold: config.flood_threshold(),
            ..FsWatcherConfig::default()
        };
        let _watcher = match FsWatcher::new(&root_path, watcher_config, tx) {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("Warning: watcher unavailable: {e}");
                None
            }
        };
        if _watcher.is_some() {
            eprintln!("watching {} (ctrl-c to quit)", root_path.display());
            loop {
                tokio::select! {
                    batch = rx.recv() => {
                        let Some(batch) = batch else { break };
                        for changed in batch {
                            let rel = tree_relative(&root_path, &changed);
                            tree.dispatch_watch_event(WatchEvent::Changed { path: rel }).await?;
                        }
                        pump_events(&mut events, &tree, &mut state, &mut decorations);
                        decorate_symlinks(&tree, &mut decorations, symlink_deco);
                        print_surface(&tree, &decorations);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    if let Some(path) = state_file.as_deref() {
        write_state(path, &state.snapshot(&tree));
    }
    Ok(())
}

fn read_state(path: &Path) -> Option<SerializableTreeState> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            eprintln!(
                "Warning: ignoring unreadable state file {}: {e}",
                path.display()
            );
            None
        }
    }
}

fn write_state(path: &Path, state: &SerializableTreeState) {
    match serde_json::to_string_pretty(state) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                eprintln!("Warning: could not save state to {}: {e}", path.display());
            }
        }
        Err(e) => eprintln!("Warning: could not serialize state: {e}"),
    }
}

/// Map an absolute filesystem path to a root-relative tree path.
fn tree_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn pump_events(
    events: &mut mpsc::UnboundedReceiver<TreeEvent>,
    tree: &Tree,
    state: &mut TreeStateManager,
    decorations: &mut DecorationsManager,
) {
    while let Ok(event) = events.try_recv() {
        state.on_tree_event(tree, &event);
        decorations.handle_tree_event(tree, &event);
    }
}

/// Tag every surface-visible symlink so the printout can show it.
fn decorate_symlinks(
    tree: &Tree,
    decorations: &mut DecorationsManager,
    deco: flatbranch::DecorationId,
) {
    let mut targets: Vec<NodeId> = Vec::new();
    let mut index = 0;
    while let Some(node) = tree.node_at_index(index) {
        if node.get_metadata("symlink") == Some(&serde_json::Value::Bool(true)) {
            targets.push(node.id());
        }
        index += 1;
    }
    for id in targets {
        decorations.add_target(tree, deco, id, TargetMatchMode::SelfOnly);
    }
}

fn print_surface(tree: &Tree, decorations: &DecorationsManager) {
    let Some(root) = tree.node(tree.root_id()) else {
        return;
    };
    println!("{} ({} rows)", root.name(), tree.branch_size());
    let mut index = 0;
    while let Some(node) = tree.node_at_index(index) {
        let indent = "  ".repeat(node.depth().saturating_sub(1));
        let marker = if node.is_composite() {
            if node.is_expanded() {
                "▾ "
            } else {
                "▸ "
            }
        } else {
            "  "
        };
        let classes = decorations.classlist(tree, node.id());
        if classes.is_empty() {
            println!("{indent}{marker}{}", node.name());
        } else {
            println!("{indent}{marker}{}  [{}]", node.name(), classes.join(" "));
        }
        index += 1;
    }
}
