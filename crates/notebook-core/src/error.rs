//! Error types for store mutations, backend calls, run starts and the queue.

use crate::id::{CellId, NotebookId};

/// Structural errors reported synchronously by store operations.
///
/// A store operation that returns one of these has not mutated anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index {index} out of range for {len} cells")]
    OutOfRange { index: usize, len: usize },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub(crate) fn notebook_not_found(id: &NotebookId) -> Self {
        StoreError::NotFound(format!("notebook {}", id))
    }

    pub(crate) fn cell_not_found(id: &CellId) -> Self {
        StoreError::NotFound(format!("cell {}", id))
    }

    /// Bad indices count as invalid arguments, same as an empty name.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidArgument(_) | StoreError::OutOfRange { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Failure reported by a [`KernelBackend`](crate::backend::KernelBackend) call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Notebook not found: {0}")]
    NotebookNotFound(NotebookId),
}

/// Why a run was not started. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunRejected {
    #[error("Notebook not found: {0}")]
    NotebookNotFound(NotebookId),

    #[error("Cell not found: {0}")]
    CellNotFound(CellId),

    #[error("Cell {0} has no source to run")]
    EmptySource(CellId),

    #[error("Cell {0} is already running")]
    AlreadyRunning(CellId),
}

/// The execution queue processor has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Execution queue processor is not running")]
pub struct QueueClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_is_invalid_argument() {
        let err = StoreError::OutOfRange { index: 4, len: 2 };
        assert!(err.is_invalid_argument());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Index 4 out of range for 2 cells");
    }

    #[test]
    fn test_not_found_messages_name_the_entity() {
        let err = StoreError::notebook_not_found(&NotebookId::from("nb-1"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: notebook nb-1");

        let err = StoreError::cell_not_found(&CellId::from("c-1"));
        assert_eq!(err.to_string(), "Not found: cell c-1");
    }

    #[test]
    fn test_missing_notebook_is_named_as_notebook() {
        let nb = NotebookId::from("nb-1");
        assert_eq!(
            RunRejected::NotebookNotFound(nb.clone()).to_string(),
            "Notebook not found: nb-1"
        );
        assert_eq!(
            BackendError::NotebookNotFound(nb).to_string(),
            "Notebook not found: nb-1"
        );
    }
}
