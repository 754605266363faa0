use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Tree engine error types.
///
/// Only invalid operations surface as errors. Child-resolution failures do
/// not appear here: a failing resolver degrades to an empty child list (see
/// `Tree::hard_reload_children`).
#[derive(Debug, Error)]
pub enum TreeError {
    /// I/O errors from filesystem-backed hosts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operations the root node refuses (rename, move, dispose via `mv`).
    #[error("operation not permitted on the root node: {0}")]
    RootOperation(&'static str),

    /// A structural operation targeted a leaf where a composite is required.
    #[error("node at '{0}' cannot contain children")]
    NotComposite(String),

    /// A node id or path that is not (or no longer) registered.
    #[error("unknown tree node: {0}")]
    UnknownNode(String),

    /// The node has already been disposed.
    #[error("node at '{0}' is disposed")]
    Disposed(String),

    /// State snapshot (de)serialization failures.
    #[error("state serialization error: {0}")]
    State(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TreeError = io_err.into();
        assert!(matches!(err, TreeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn root_operation_display() {
        let err = TreeError::RootOperation("rename");
        assert_eq!(
            err.to_string(),
            "operation not permitted on the root node: rename"
        );
    }

    #[test]
    fn not_composite_display() {
        let err = TreeError::NotComposite("/root/file.txt".into());
        assert_eq!(
            err.to_string(),
            "node at '/root/file.txt' cannot contain children"
        );
    }
}
