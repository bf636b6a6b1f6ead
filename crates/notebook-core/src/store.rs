//! The notebook store: sole owner and writer of notebook and cell state.
//!
//! Every operation is synchronous and leaves the store's invariants intact
//! on return:
//!
//! - the active notebook, if set, exists
//! - the active cell, if set, belongs to the active notebook
//! - each notebook has at most one registered kernel connection
//!
//! Mutations that name an unknown notebook or cell are silent no-ops unless
//! documented otherwise, so async work that resumes after a concurrent
//! delete can call back into the store without special casing.
//!
//! Tasks share the store as a [`SharedStore`]. Each operation takes the lock
//! once and the lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cell::{Cell, CellDraft, CellPatch, CellStatus, OutputEvent};
use crate::connection::{ConnectionRegistry, KernelConnection, Superseded};
use crate::error::{RunRejected, StoreError};
use crate::id::{CellId, NotebookId, RunId};
use crate::notebook::{KernelStatus, Notebook, NotebookPatch, NotebookSummary};
use crate::settings::Settings;

pub type SharedStore = Arc<Mutex<NotebookStore>>;

/// Lock a shared store for one operation.
///
/// Every store operation leaves the invariants intact before it returns, so
/// a guard poisoned by a panicking holder is still safe to use.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, NotebookStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Change notification emitted after each successful mutation.
///
/// Receivers re-read the store; events carry IDs, not state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    NotebookCreated {
        notebook_id: NotebookId,
    },
    NotebookDeleted {
        notebook_id: NotebookId,
    },
    NotebookUpdated {
        notebook_id: NotebookId,
    },
    ActiveChanged {
        notebook_id: Option<NotebookId>,
        cell_id: Option<CellId>,
    },
    CellAdded {
        notebook_id: NotebookId,
        cell_id: CellId,
        index: usize,
    },
    CellDeleted {
        notebook_id: NotebookId,
        cell_id: CellId,
    },
    CellUpdated {
        notebook_id: NotebookId,
        cell_id: CellId,
    },
    CellMoved {
        notebook_id: NotebookId,
        cell_id: CellId,
        from: usize,
        to: usize,
    },
    CellOutput {
        notebook_id: NotebookId,
        cell_id: CellId,
    },
    CellStatusChanged {
        notebook_id: NotebookId,
        cell_id: CellId,
        status: CellStatus,
    },
}

/// How a run ended, as reported to [`NotebookStore::finish_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Failed(String),
}

#[derive(Debug)]
pub struct NotebookStore {
    notebooks: HashMap<NotebookId, Notebook>,
    /// Creation order
    order: Vec<NotebookId>,
    active_notebook_id: Option<NotebookId>,
    active_cell_id: Option<CellId>,
    connections: ConnectionRegistry,
    settings: Settings,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for NotebookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotebookStore {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            notebooks: HashMap::new(),
            order: Vec::new(),
            active_notebook_id: None,
            active_cell_id: None,
            connections: ConnectionRegistry::new(),
            settings,
            events,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to change notifications. Slow receivers lag; they never
    /// block mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_active(&self) {
        self.emit(StoreEvent::ActiveChanged {
            notebook_id: self.active_notebook_id.clone(),
            cell_id: self.active_cell_id.clone(),
        });
    }

    // ==================== Notebooks ====================

    /// Create a notebook with one empty code cell and make it (and that cell)
    /// active.
    pub fn create_notebook(&mut self, name: &str) -> Result<NotebookId, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "notebook name must not be empty".to_string(),
            ));
        }

        let notebook = Notebook::new(name.to_string());
        let id = notebook.id.clone();
        let first_cell = notebook.cells.first().map(|c| c.id.clone());
        info!("[store] Created notebook {} ({:?})", id, name);

        self.order.push(id.clone());
        self.notebooks.insert(id.clone(), notebook);
        self.active_notebook_id = Some(id.clone());
        self.active_cell_id = first_cell;

        self.emit(StoreEvent::NotebookCreated {
            notebook_id: id.clone(),
        });
        self.emit_active();
        Ok(id)
    }

    /// Remove a notebook. Unknown IDs are a no-op.
    ///
    /// If it was active, the notebook that followed it in creation order (or
    /// else the last remaining one) becomes active, with its first cell.
    /// Returns the notebook's kernel connection, if one was registered; the
    /// caller must close it.
    pub fn delete_notebook(&mut self, id: &NotebookId) -> Option<Superseded> {
        let Some(pos) = self.order.iter().position(|n| n == id) else {
            debug!("[store] delete_notebook: {} not found, ignoring", id);
            return None;
        };
        self.order.remove(pos);
        self.notebooks.remove(id);
        info!("[store] Deleted notebook {}", id);
        self.emit(StoreEvent::NotebookDeleted {
            notebook_id: id.clone(),
        });

        if self.active_notebook_id.as_ref() == Some(id) {
            let next = self
                .order
                .get(pos)
                .or_else(|| self.order.last())
                .cloned();
            self.active_cell_id = next
                .as_ref()
                .and_then(|n| self.notebooks.get(n))
                .and_then(|nb| nb.cells.first())
                .map(|c| c.id.clone());
            self.active_notebook_id = next;
            self.emit_active();
        }

        self.connections.take(id)
    }

    /// Merge `patch` into notebook metadata. Unknown IDs are a no-op.
    pub fn update_notebook(
        &mut self,
        id: &NotebookId,
        patch: NotebookPatch,
    ) -> Result<(), StoreError> {
        let Some(notebook) = self.notebooks.get_mut(id) else {
            debug!("[store] update_notebook: {} not found, ignoring", id);
            return Ok(());
        };

        let name = match patch.name {
            Some(name) => {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    return Err(StoreError::InvalidArgument(
                        "notebook name must not be empty".to_string(),
                    ));
                }
                Some(trimmed.to_string())
            }
            None => None,
        };

        if let Some(name) = name {
            notebook.name = name;
        }
        if let Some(kernel_id) = patch.kernel_id {
            notebook.kernel_id = kernel_id;
        }
        if let Some(status) = patch.kernel_status {
            notebook.kernel_status = status;
        }
        notebook.touch();

        self.emit(StoreEvent::NotebookUpdated {
            notebook_id: id.clone(),
        });
        Ok(())
    }

    /// Point the active notebook at `id`.
    ///
    /// The active cell survives only if it belongs to `id`.
    pub fn set_active_notebook(&mut self, id: &NotebookId) -> Result<(), StoreError> {
        let Some(notebook) = self.notebooks.get(id) else {
            return Err(StoreError::notebook_not_found(id));
        };
        let keeps_cell = self
            .active_cell_id
            .as_ref()
            .map(|cell_id| notebook.contains_cell(cell_id))
            .unwrap_or(false);
        if !keeps_cell {
            self.active_cell_id = None;
        }
        self.active_notebook_id = Some(id.clone());
        self.emit_active();
        Ok(())
    }

    // ==================== Cells ====================

    /// Append a new cell. The store always assigns a fresh ID.
    pub fn add_cell(
        &mut self,
        notebook_id: &NotebookId,
        draft: CellDraft,
    ) -> Result<CellId, StoreError> {
        let notebook = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| StoreError::notebook_not_found(notebook_id))?;

        let cell = Cell::from_draft(draft);
        let cell_id = cell.id.clone();
        let index = notebook.cells.len();
        notebook.cells.push(cell);
        notebook.touch();

        self.emit(StoreEvent::CellAdded {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
            index,
        });
        Ok(cell_id)
    }

    /// Insert a new cell right after `after`, or at the top when `after` is
    /// `None`.
    pub fn insert_cell(
        &mut self,
        notebook_id: &NotebookId,
        draft: CellDraft,
        after: Option<&CellId>,
    ) -> Result<CellId, StoreError> {
        let notebook = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| StoreError::notebook_not_found(notebook_id))?;

        let index = match after {
            Some(anchor) => {
                notebook
                    .find_cell_index(anchor)
                    .ok_or_else(|| StoreError::cell_not_found(anchor))?
                    + 1
            }
            None => 0,
        };

        let cell = Cell::from_draft(draft);
        let cell_id = cell.id.clone();
        notebook.cells.insert(index, cell);
        notebook.touch();

        self.emit(StoreEvent::CellAdded {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
            index,
        });
        Ok(cell_id)
    }

    /// Remove a cell, keeping the order of the rest. Returns whether a cell
    /// was removed.
    pub fn delete_cell(&mut self, notebook_id: &NotebookId, cell_id: &CellId) -> bool {
        let Some(notebook) = self.notebooks.get_mut(notebook_id) else {
            debug!("[store] delete_cell: notebook {} not found", notebook_id);
            return false;
        };
        let Some(index) = notebook.find_cell_index(cell_id) else {
            debug!("[store] delete_cell: cell {} not found", cell_id);
            return false;
        };

        let removed = notebook.cells.remove(index);
        if removed.is_running() {
            debug!(
                "[store] Deleted running cell {}; its late output will be dropped",
                cell_id
            );
            if notebook.kernel_status == KernelStatus::Busy && !notebook.has_running_cells() {
                notebook.kernel_status = KernelStatus::Idle;
            }
        }
        notebook.touch();

        self.emit(StoreEvent::CellDeleted {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
        });

        if self.active_cell_id.as_ref() == Some(cell_id) {
            self.active_cell_id = None;
            self.emit_active();
        }
        true
    }

    /// Merge `patch` into one cell. Returns whether a cell was updated.
    pub fn update_cell(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
        patch: CellPatch,
    ) -> bool {
        let Some(notebook) = self.notebooks.get_mut(notebook_id) else {
            debug!("[store] update_cell: notebook {} not found", notebook_id);
            return false;
        };
        let Some(cell) = notebook.cell_mut(cell_id) else {
            debug!("[store] update_cell: cell {} not found", cell_id);
            return false;
        };

        cell.apply_patch(patch);
        notebook.touch();

        self.emit(StoreEvent::CellUpdated {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
        });
        true
    }

    /// Move the cell at `from` to `to`, with `to` counted against the
    /// sequence after the cell has been taken out.
    ///
    /// Moving `0 -> 2` in `[A, B, C, D]` yields `[B, C, A, D]`.
    pub fn reorder_cell(
        &mut self,
        notebook_id: &NotebookId,
        from: usize,
        to: usize,
    ) -> Result<(), StoreError> {
        let notebook = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| StoreError::notebook_not_found(notebook_id))?;

        notebook.move_cell(from, to)?;
        if from == to {
            return Ok(());
        }
        notebook.touch();

        let cell_id = notebook.cells[to].id.clone();
        self.emit(StoreEvent::CellMoved {
            notebook_id: notebook_id.clone(),
            cell_id,
            from,
            to,
        });
        Ok(())
    }

    /// Select a cell of the active notebook.
    pub fn set_active_cell(&mut self, cell_id: &CellId) -> Result<(), StoreError> {
        let contains = self
            .active_notebook()
            .map(|nb| nb.contains_cell(cell_id))
            .unwrap_or(false);
        if !contains {
            return Err(StoreError::cell_not_found(cell_id));
        }
        self.active_cell_id = Some(cell_id.clone());
        self.emit_active();
        Ok(())
    }

    pub fn clear_active_cell(&mut self) {
        if self.active_cell_id.take().is_some() {
            self.emit_active();
        }
    }

    /// Merge an output event into a cell using the configured output policy.
    /// Returns whether the event was applied.
    pub fn update_cell_output(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
        event: OutputEvent,
    ) -> bool {
        let policy = self.settings.output_policy;
        let Some(notebook) = self.notebooks.get_mut(notebook_id) else {
            debug!("[store] update_cell_output: notebook {} not found", notebook_id);
            return false;
        };
        let Some(cell) = notebook.cell_mut(cell_id) else {
            debug!("[store] update_cell_output: cell {} not found", cell_id);
            return false;
        };

        cell.apply_output(event, policy);
        notebook.touch();

        self.emit(StoreEvent::CellOutput {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
        });
        true
    }

    // ==================== Runs ====================

    /// Mark a cell as running and hand out the token for this run.
    ///
    /// Clears the cell's output and marks the notebook's kernel busy. Rejected
    /// starts leave the store untouched.
    pub fn begin_run(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<RunId, RunRejected> {
        let notebook = self
            .notebooks
            .get_mut(notebook_id)
            .ok_or_else(|| RunRejected::NotebookNotFound(notebook_id.clone()))?;
        let cell = notebook
            .cell_mut(cell_id)
            .ok_or_else(|| RunRejected::CellNotFound(cell_id.clone()))?;

        if cell.is_running() {
            return Err(RunRejected::AlreadyRunning(cell_id.clone()));
        }
        if cell.content.trim().is_empty() {
            return Err(RunRejected::EmptySource(cell_id.clone()));
        }

        let run_id = RunId::generate();
        cell.output.clear();
        cell.status = CellStatus::Running;
        cell.active_run = Some(run_id.clone());
        if notebook.kernel_status != KernelStatus::Dead {
            notebook.kernel_status = KernelStatus::Busy;
        }
        notebook.touch();

        self.emit(StoreEvent::CellStatusChanged {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
            status: CellStatus::Running,
        });
        Ok(run_id)
    }

    fn run_cell_mut(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
        run_id: &RunId,
    ) -> Option<(&mut Notebook, usize)> {
        let notebook = self.notebooks.get_mut(notebook_id)?;
        let index = notebook.find_cell_index(cell_id)?;
        let cell = &notebook.cells[index];
        if cell.active_run.as_ref() != Some(run_id) || !cell.is_running() {
            return None;
        }
        Some((notebook, index))
    }

    /// Commit output for a run, unless the cell is gone or the run was
    /// superseded. Returns whether the event was applied.
    pub fn commit_run_output(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
        run_id: &RunId,
        event: OutputEvent,
    ) -> bool {
        let policy = self.settings.output_policy;
        let Some((notebook, index)) = self.run_cell_mut(notebook_id, cell_id, run_id) else {
            debug!(
                "[store] Dropping output for stale run {} of cell {}",
                run_id, cell_id
            );
            return false;
        };

        notebook.cells[index].apply_output(event, policy);
        notebook.touch();

        self.emit(StoreEvent::CellOutput {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
        });
        true
    }

    /// Settle a run. Returns the cell's new status, or `None` if the run was
    /// stale and nothing changed.
    pub fn finish_run(
        &mut self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
        run_id: &RunId,
        end: RunEnd,
    ) -> Option<CellStatus> {
        let policy = self.settings.output_policy;
        let Some((notebook, index)) = self.run_cell_mut(notebook_id, cell_id, run_id) else {
            debug!(
                "[store] Ignoring completion of stale run {} of cell {}",
                run_id, cell_id
            );
            return None;
        };

        let cell = &mut notebook.cells[index];
        cell.active_run = None;
        let status = match end {
            RunEnd::Completed => {
                cell.execution_count = Some(cell.execution_count.unwrap_or(0) + 1);
                CellStatus::Completed
            }
            RunEnd::Failed(message) => {
                let timestamp = chrono::Utc::now().timestamp_millis();
                cell.apply_output(OutputEvent::error(message, timestamp), policy);
                CellStatus::Error
            }
        };
        cell.status = status;

        if notebook.kernel_status == KernelStatus::Busy && !notebook.has_running_cells() {
            notebook.kernel_status = KernelStatus::Idle;
        }
        notebook.touch();

        self.emit(StoreEvent::CellStatusChanged {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
            status,
        });
        Some(status)
    }

    // ==================== Connections ====================

    /// Register the live kernel connection for a notebook.
    ///
    /// Returns the handle that is now orphaned and must be closed by the
    /// caller: the one this replaces, or `connection` itself when the
    /// notebook no longer exists.
    pub fn register_connection(
        &mut self,
        notebook_id: &NotebookId,
        connection: Box<dyn KernelConnection>,
    ) -> Option<Superseded> {
        if !self.notebooks.contains_key(notebook_id) {
            debug!(
                "[store] register_connection: notebook {} gone, returning handle",
                notebook_id
            );
            return Some(Superseded::orphaned(connection));
        }
        self.connections.register(notebook_id.clone(), connection)
    }

    /// Remove and return a notebook's connection. The caller must close it.
    pub fn take_connection(&mut self, notebook_id: &NotebookId) -> Option<Superseded> {
        self.connections.take(notebook_id)
    }

    pub fn connection(&self, notebook_id: &NotebookId) -> Option<&dyn KernelConnection> {
        self.connections.get(notebook_id)
    }

    // ==================== Reads ====================

    /// Notebooks in creation order.
    pub fn notebooks(&self) -> impl Iterator<Item = &Notebook> {
        self.order.iter().filter_map(|id| self.notebooks.get(id))
    }

    pub fn notebook_summaries(&self) -> Vec<NotebookSummary> {
        self.notebooks().map(Notebook::summary).collect()
    }

    pub fn notebook_count(&self) -> usize {
        self.order.len()
    }

    pub fn notebook(&self, id: &NotebookId) -> Option<&Notebook> {
        self.notebooks.get(id)
    }

    pub fn cell(&self, notebook_id: &NotebookId, cell_id: &CellId) -> Option<&Cell> {
        self.notebooks.get(notebook_id)?.cell(cell_id)
    }

    pub fn active_notebook_id(&self) -> Option<&NotebookId> {
        self.active_notebook_id.as_ref()
    }

    pub fn active_cell_id(&self) -> Option<&CellId> {
        self.active_cell_id.as_ref()
    }

    pub fn active_notebook(&self) -> Option<&Notebook> {
        self.notebooks.get(self.active_notebook_id.as_ref()?)
    }

    pub fn active_cell(&self) -> Option<&Cell> {
        self.active_notebook()?.cell(self.active_cell_id.as_ref()?)
    }
}
