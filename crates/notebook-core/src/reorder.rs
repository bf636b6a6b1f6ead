//! Drag-and-drop reordering.
//!
//! A drop names cells by ID. Indices are resolved only when the drop is
//! applied, so concurrent additions, deletions or moves between the start of
//! a drag and the drop cannot shift the wrong cell.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::id::{CellId, NotebookId};
use crate::store::NotebookStore;

/// A finished drag gesture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropInstruction {
    pub moved: CellId,
    /// The cell the dragged one was dropped on. `None` if released outside
    /// any cell.
    pub target: Option<CellId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DropOutcome {
    Ignored,
    Moved { from: usize, to: usize },
}

/// Move `moved` to the position currently held by `target`.
///
/// Drops onto nothing, onto the dragged cell itself or naming a cell that no
/// longer exists are ignored without touching the store.
pub fn apply_drop(
    store: &mut NotebookStore,
    notebook_id: &NotebookId,
    instruction: &DropInstruction,
) -> Result<DropOutcome, StoreError> {
    let Some(target) = instruction.target.as_ref() else {
        debug!("[reorder] Drop of {} outside any cell", instruction.moved);
        return Ok(DropOutcome::Ignored);
    };
    if *target == instruction.moved {
        return Ok(DropOutcome::Ignored);
    }

    let Some(notebook) = store.notebook(notebook_id) else {
        debug!("[reorder] Notebook {} gone, ignoring drop", notebook_id);
        return Ok(DropOutcome::Ignored);
    };
    let (Some(from), Some(to)) = (
        notebook.find_cell_index(&instruction.moved),
        notebook.find_cell_index(target),
    ) else {
        debug!(
            "[reorder] Drop of {} onto {} names a missing cell, ignoring",
            instruction.moved, target
        );
        return Ok(DropOutcome::Ignored);
    };

    store.reorder_cell(notebook_id, from, to)?;
    info!("[reorder] Moved cell {} from {} to {}", instruction.moved, from, to);
    Ok(DropOutcome::Moved { from, to })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellDraft;

    fn notebook_with(store: &mut NotebookStore, n: usize) -> (NotebookId, Vec<CellId>) {
        let nb = store.create_notebook("drag").unwrap();
        for i in 1..n {
            store.add_cell(&nb, CellDraft::code(format!("c{}", i))).unwrap();
        }
        let ids = store.notebook(&nb).unwrap().cell_ids();
        (nb, ids)
    }

    fn drop_on(moved: &CellId, target: Option<&CellId>) -> DropInstruction {
        DropInstruction {
            moved: moved.clone(),
            target: target.cloned(),
        }
    }

    #[test]
    fn test_drop_moves_to_target_position() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 4);

        let outcome = apply_drop(&mut store, &nb, &drop_on(&ids[0], Some(&ids[2]))).unwrap();

        assert_eq!(outcome, DropOutcome::Moved { from: 0, to: 2 });
        assert_eq!(
            store.notebook(&nb).unwrap().cell_ids(),
            vec![ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[3].clone()]
        );
    }

    #[test]
    fn test_drop_upwards() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 3);

        let outcome = apply_drop(&mut store, &nb, &drop_on(&ids[2], Some(&ids[0]))).unwrap();

        assert_eq!(outcome, DropOutcome::Moved { from: 2, to: 0 });
        assert_eq!(
            store.notebook(&nb).unwrap().cell_ids(),
            vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]
        );
    }

    #[test]
    fn test_drop_outside_or_onto_self_is_ignored() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 3);
        let before = store.notebook(&nb).unwrap().updated_at;

        assert_eq!(
            apply_drop(&mut store, &nb, &drop_on(&ids[1], None)).unwrap(),
            DropOutcome::Ignored
        );
        assert_eq!(
            apply_drop(&mut store, &nb, &drop_on(&ids[1], Some(&ids[1]))).unwrap(),
            DropOutcome::Ignored
        );
        assert_eq!(store.notebook(&nb).unwrap().cell_ids(), ids);
        assert_eq!(store.notebook(&nb).unwrap().updated_at, before);
    }

    #[test]
    fn test_drop_naming_deleted_cell_is_ignored() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 3);
        store.delete_cell(&nb, &ids[2]);

        let outcome = apply_drop(&mut store, &nb, &drop_on(&ids[0], Some(&ids[2]))).unwrap();

        assert_eq!(outcome, DropOutcome::Ignored);
        assert_eq!(store.notebook(&nb).unwrap().cell_ids(), ids[..2].to_vec());
    }

    #[test]
    fn test_drop_of_deleted_cell_is_ignored() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 3);
        store.delete_cell(&nb, &ids[0]);
        let before = store.notebook(&nb).unwrap().updated_at;

        let outcome = apply_drop(&mut store, &nb, &drop_on(&ids[0], Some(&ids[2]))).unwrap();

        assert_eq!(outcome, DropOutcome::Ignored);
        assert_eq!(store.notebook(&nb).unwrap().cell_ids(), ids[1..].to_vec());
        assert_eq!(store.notebook(&nb).unwrap().updated_at, before);
    }

    #[test]
    fn test_indices_resolve_at_drop_time() {
        let mut store = NotebookStore::new();
        let (nb, ids) = notebook_with(&mut store, 4);
        // Drag of ids[3] onto ids[1] starts, then the first cell goes away.
        store.delete_cell(&nb, &ids[0]);

        let outcome = apply_drop(&mut store, &nb, &drop_on(&ids[3], Some(&ids[1]))).unwrap();

        assert_eq!(outcome, DropOutcome::Moved { from: 2, to: 0 });
        assert_eq!(
            store.notebook(&nb).unwrap().cell_ids(),
            vec![ids[3].clone(), ids[1].clone(), ids[2].clone()]
        );
    }

    #[test]
    fn test_drop_in_unknown_notebook_is_ignored() {
        let mut store = NotebookStore::new();
        let (_nb, ids) = notebook_with(&mut store, 2);

        let outcome = apply_drop(
            &mut store,
            &NotebookId::from("missing"),
            &drop_on(&ids[0], Some(&ids[1])),
        )
        .unwrap();

        assert_eq!(outcome, DropOutcome::Ignored);
    }
}
