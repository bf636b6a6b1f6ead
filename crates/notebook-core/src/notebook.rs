//! Notebook entity: an ordered sequence of cells plus kernel metadata.
//!
//! The order of `cells` is the document. Structural primitives here keep
//! cell identity intact; the store decides when they run and bumps
//! `updated_at` through [`Notebook::touch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellDraft, CellStatus};
use crate::error::StoreError;
use crate::id::{CellId, NotebookId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    #[default]
    Idle,
    Starting,
    Busy,
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: NotebookId,
    pub name: String,
    pub cells: Vec<Cell>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once a backend execution context exists
    pub kernel_id: Option<String>,
    pub kernel_status: KernelStatus,
}

impl Notebook {
    /// New notebook holding a single empty code cell.
    pub(crate) fn new(name: String) -> Self {
        let now = Utc::now();
        Notebook {
            id: NotebookId::generate(),
            name,
            cells: vec![Cell::from_draft(CellDraft::code(""))],
            created_at: now,
            updated_at: now,
            kernel_id: None,
            kernel_status: KernelStatus::Idle,
        }
    }

    /// Advance `updated_at`, never moving it backwards.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn find_cell_index(&self, cell_id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| &c.id == cell_id)
    }

    pub fn cell(&self, cell_id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| &c.id == cell_id)
    }

    pub(crate) fn cell_mut(&mut self, cell_id: &CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| &c.id == cell_id)
    }

    pub fn contains_cell(&self, cell_id: &CellId) -> bool {
        self.find_cell_index(cell_id).is_some()
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.iter().map(|c| c.id.clone()).collect()
    }

    pub fn has_running_cells(&self) -> bool {
        self.cells.iter().any(|c| c.status == CellStatus::Running)
    }

    /// Splice the cell at `from` out and back in at `to`, where `to` is
    /// interpreted against the sequence after removal.
    pub(crate) fn move_cell(&mut self, from: usize, to: usize) -> Result<(), StoreError> {
        let len = self.cells.len();
        for index in [from, to] {
            if index >= len {
                return Err(StoreError::OutOfRange { index, len });
            }
        }
        if from != to {
            let cell = self.cells.remove(from);
            self.cells.insert(to, cell);
        }
        Ok(())
    }

    pub fn summary(&self) -> NotebookSummary {
        NotebookSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            cell_count: self.cells.len(),
            kernel_status: self.kernel_status,
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight listing entry for the notebook list view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookSummary {
    pub id: NotebookId,
    pub name: String,
    pub cell_count: usize,
    pub kernel_status: KernelStatus,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for notebook metadata; `None` fields are left untouched.
///
/// `kernel_id: Some(None)` clears the kernel ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_status: Option<KernelStatus>,
}

impl NotebookPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn kernel_status(status: KernelStatus) -> Self {
        Self {
            kernel_status: Some(status),
            ..Default::default()
        }
    }
}
