//! Per-cell run protocol and output reconciliation.
//!
//! A run goes through three steps:
//!
//! 1. [`ExecutionCoordinator::start_run`] marks the cell running and records a
//!    run token, synchronously, before any backend call.
//! 2. [`ActiveRun::drive`] pushes the source with `update_cell`, then calls
//!    `execute_cell` and commits every output event that arrives while it is
//!    pending. Each commit is checked against the run token.
//! 3. When `execute_cell` resolves, the run settles as completed or error.
//!
//! Backend failures never escape: they end up as the cell's `error` status.
//! The store lock is taken once per commit and never held across an await.

use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::backend::{ExecuteRequest, KernelBackend, OutputSink, UpdateCellRequest};
use crate::cell::{CellStatus, OutputEvent};
use crate::error::{BackendError, RunRejected};
use crate::id::{CellId, NotebookId, RunId};
use crate::notebook::{KernelStatus, Notebook, NotebookPatch};
use crate::store::{lock, RunEnd, SharedStore};

/// How a run ended, as seen by whoever started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { execution_count: u32 },
    Failed { message: String },
    /// The cell was deleted or re-run before this run settled.
    Dropped,
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: SharedStore,
    backend: Arc<dyn KernelBackend>,
}

impl ExecutionCoordinator {
    pub fn new(store: SharedStore, backend: Arc<dyn KernelBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Mark the cell running and capture the source to execute.
    ///
    /// The cell is observably `running` as soon as this returns `Ok`.
    pub fn start_run(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<ActiveRun, RunRejected> {
        let mut store = lock(&self.store);
        let run_id = store.begin_run(notebook_id, cell_id)?;
        let code = store
            .cell(notebook_id, cell_id)
            .map(|c| c.content.clone())
            .unwrap_or_default();
        drop(store);

        info!("[exec] Started run {} for cell {}", run_id, cell_id);
        Ok(ActiveRun {
            coordinator: self.clone(),
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
            run_id,
            code,
        })
    }

    /// Start a run and drive it on a background task.
    pub fn run_cell(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<RunHandle, RunRejected> {
        let run = self.start_run(notebook_id, cell_id)?;
        let run_id = run.run_id.clone();
        let task = tokio::spawn(run.drive());
        Ok(RunHandle { run_id, task })
    }

    /// Create the backend execution context for a notebook and register its
    /// connection. Returns the kernel ID.
    ///
    /// The status goes through `starting` unless cells are running, in which
    /// case it stays `busy`. On failure it becomes `dead`.
    pub async fn attach_kernel(&self, notebook_id: &NotebookId) -> Result<String, BackendError> {
        let name = {
            let mut store = lock(&self.store);
            let (name, running) = store
                .notebook(notebook_id)
                .map(|nb| (nb.name.clone(), nb.has_running_cells()))
                .ok_or_else(|| BackendError::NotebookNotFound(notebook_id.clone()))?;
            if !running {
                let _ = store.update_notebook(
                    notebook_id,
                    NotebookPatch::kernel_status(KernelStatus::Starting),
                );
            }
            name
        };

        let connection = match self.backend.create_notebook(notebook_id, &name).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("[exec] Kernel for notebook {} failed to start: {}", notebook_id, e);
                let _ = lock(&self.store).update_notebook(
                    notebook_id,
                    NotebookPatch::kernel_status(KernelStatus::Dead),
                );
                return Err(e);
            }
        };
        let kernel_id = connection.kernel_id().to_string();

        let (orphan, attached) = {
            let mut store = lock(&self.store);
            let status = store.notebook(notebook_id).map(settled_status);
            let orphan = store.register_connection(notebook_id, connection);
            if let Some(status) = status {
                let _ = store.update_notebook(
                    notebook_id,
                    NotebookPatch {
                        name: None,
                        kernel_id: Some(Some(kernel_id.clone())),
                        kernel_status: Some(status),
                    },
                );
            }
            (orphan, status.is_some())
        };
        if let Some(orphan) = orphan {
            orphan.close();
        }

        if !attached {
            warn!(
                "[exec] Notebook {} was deleted while its kernel started",
                notebook_id
            );
            if let Err(e) = self.backend.delete_notebook(notebook_id).await {
                warn!("[exec] Failed to delete remote notebook {}: {}", notebook_id, e);
            }
            return Err(BackendError::NotebookNotFound(notebook_id.clone()));
        }

        info!("[exec] Attached kernel {} to notebook {}", kernel_id, notebook_id);
        Ok(kernel_id)
    }

    /// Close a notebook's connection and delete its remote counterpart.
    ///
    /// Without a registered connection nothing changes.
    pub async fn detach_kernel(&self, notebook_id: &NotebookId) -> Result<(), BackendError> {
        let connection = {
            let mut store = lock(&self.store);
            let Some(connection) = store.take_connection(notebook_id) else {
                return Ok(());
            };
            let status = store.notebook(notebook_id).map(settled_status);
            let _ = store.update_notebook(
                notebook_id,
                NotebookPatch {
                    name: None,
                    kernel_id: Some(None),
                    kernel_status: status,
                },
            );
            connection
        };
        connection.close();
        self.backend.delete_notebook(notebook_id).await
    }

    /// Delete a notebook from the store, closing and deleting its kernel if it
    /// had one.
    pub async fn remove_notebook(&self, notebook_id: &NotebookId) -> Result<(), BackendError> {
        let connection = lock(&self.store).delete_notebook(notebook_id);
        let Some(connection) = connection else {
            return Ok(());
        };
        connection.close();
        self.backend.delete_notebook(notebook_id).await
    }
}

/// Kernel status once a connection change settles.
fn settled_status(notebook: &Notebook) -> KernelStatus {
    if notebook.has_running_cells() {
        KernelStatus::Busy
    } else {
        KernelStatus::Idle
    }
}

/// A run that has been started but not driven yet.
pub struct ActiveRun {
    coordinator: ExecutionCoordinator,
    notebook_id: NotebookId,
    cell_id: CellId,
    run_id: RunId,
    code: String,
}

impl ActiveRun {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// Talk to the backend and reconcile the run's output into the store.
    pub async fn drive(self) -> RunOutcome {
        let backend = self.coordinator.backend.clone();

        let update = backend
            .update_cell(UpdateCellRequest {
                notebook_id: self.notebook_id.clone(),
                cell_id: self.cell_id.clone(),
                content: self.code.clone(),
            })
            .await;
        if let Err(e) = update {
            warn!("[exec] update_cell failed for cell {}: {}", self.cell_id, e);
            return self.settle(RunEnd::Failed(e.to_string()));
        }

        let (sink, mut outputs) = OutputSink::channel();
        let mut execute = backend.execute_cell(
            ExecuteRequest {
                notebook_id: self.notebook_id.clone(),
                cell_id: self.cell_id.clone(),
                code: self.code.clone(),
            },
            sink,
        );

        let mut stream_open = true;
        let result = loop {
            tokio::select! {
                biased;
                event = outputs.recv(), if stream_open => match event {
                    Some(event) => self.commit(event),
                    None => stream_open = false,
                },
                result = &mut execute => break result,
            }
        };
        // Events sent before execute resolved still belong to this run.
        while let Ok(event) = outputs.try_recv() {
            self.commit(event);
        }

        match result {
            Ok(()) => self.settle(RunEnd::Completed),
            Err(e) => {
                warn!("[exec] execute_cell failed for cell {}: {}", self.cell_id, e);
                self.settle(RunEnd::Failed(e.to_string()))
            }
        }
    }

    fn commit(&self, event: OutputEvent) {
        lock(&self.coordinator.store).commit_run_output(
            &self.notebook_id,
            &self.cell_id,
            &self.run_id,
            event,
        );
    }

    fn settle(&self, end: RunEnd) -> RunOutcome {
        let mut store = lock(&self.coordinator.store);
        let message = match &end {
            RunEnd::Failed(message) => message.clone(),
            RunEnd::Completed => String::new(),
        };
        let status = store.finish_run(&self.notebook_id, &self.cell_id, &self.run_id, end);
        let outcome = match status {
            Some(CellStatus::Completed) => RunOutcome::Completed {
                execution_count: store
                    .cell(&self.notebook_id, &self.cell_id)
                    .and_then(|c| c.execution_count)
                    .unwrap_or(0),
            },
            Some(_) => RunOutcome::Failed { message },
            None => RunOutcome::Dropped,
        };
        drop(store);

        info!("[exec] Run {} for cell {} ended: {:?}", self.run_id, self.cell_id, outcome);
        outcome
    }
}

/// A run driven on a background task.
pub struct RunHandle {
    run_id: RunId,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[exec] Run {} task did not finish: {}", self.run_id, e);
                RunOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellPatch, OutputKind};
    use crate::simulated_kernel::{SimulatedKernel, SimulatedKernelConfig};
    use crate::store::NotebookStore;
    use std::time::Duration;

    fn setup(code: &str) -> (ExecutionCoordinator, Arc<SimulatedKernel>, NotebookId, CellId) {
        let kernel = Arc::new(SimulatedKernel::new(SimulatedKernelConfig {
            event_delay: Duration::from_millis(1),
            ..Default::default()
        }));
        let store = NotebookStore::new().into_shared();
        let (nb, cell) = {
            let mut s = lock(&store);
            let nb = s.create_notebook("test").unwrap();
            let cell = s.notebook(&nb).unwrap().cells[0].id.clone();
            s.update_cell(&nb, &cell, CellPatch::content(code));
            (nb, cell)
        };
        (
            ExecutionCoordinator::new(store, kernel.clone()),
            kernel,
            nb,
            cell,
        )
    }

    fn status(coordinator: &ExecutionCoordinator, nb: &NotebookId, cell: &CellId) -> CellStatus {
        lock(coordinator.store()).cell(nb, cell).unwrap().status
    }

    #[tokio::test]
    async fn test_start_run_is_synchronously_running() {
        let (coordinator, _kernel, nb, cell) = setup("x = 1");

        let run = coordinator.start_run(&nb, &cell).unwrap();

        assert_eq!(status(&coordinator, &nb, &cell), CellStatus::Running);
        assert_eq!(
            lock(coordinator.store()).cell(&nb, &cell).unwrap().active_run(),
            Some(run.run_id())
        );
    }

    #[tokio::test]
    async fn test_drive_completes_and_counts() {
        let (coordinator, _kernel, nb, cell) = setup("x = 1\nprint(x)");

        let outcome = coordinator.start_run(&nb, &cell).unwrap().drive().await;

        assert_eq!(outcome, RunOutcome::Completed { execution_count: 1 });
        let store = lock(coordinator.store());
        let c = store.cell(&nb, &cell).unwrap();
        assert_eq!(c.status, CellStatus::Completed);
        assert_eq!(c.execution_count, Some(1));
        // Replace policy keeps only the final execute_result.
        assert_eq!(c.output.len(), 1);
        assert_eq!(c.output[0].kind, OutputKind::ExecuteResult);
        assert_eq!(store.notebook(&nb).unwrap().kernel_status, KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_second_run_increments_count_by_one() {
        let (coordinator, _kernel, nb, cell) = setup("x = 1");

        coordinator.run_cell(&nb, &cell).unwrap().wait().await;
        let outcome = coordinator.run_cell(&nb, &cell).unwrap().wait().await;

        assert_eq!(outcome, RunOutcome::Completed { execution_count: 2 });
    }

    #[tokio::test]
    async fn test_execute_failure_sets_error_without_count() {
        let (coordinator, _kernel, nb, cell) = setup("raise ValueError()");

        let outcome = coordinator.run_cell(&nb, &cell).unwrap().wait().await;

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        let store = lock(coordinator.store());
        let c = store.cell(&nb, &cell).unwrap();
        assert_eq!(c.status, CellStatus::Error);
        assert!(c.execution_count.is_none());
        assert_eq!(c.last_output().unwrap().kind, OutputKind::Error);
    }

    #[tokio::test]
    async fn test_update_failure_sets_error() {
        let (coordinator, kernel, nb, cell) = setup("x = 1");
        kernel.fail_updates(true);

        let outcome = coordinator.run_cell(&nb, &cell).unwrap().wait().await;

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(status(&coordinator, &nb, &cell), CellStatus::Error);
    }

    #[tokio::test]
    async fn test_rejected_runs_do_not_touch_state() {
        let (coordinator, _kernel, nb, cell) = setup("   ");

        assert_eq!(
            coordinator.run_cell(&nb, &cell).err(),
            Some(RunRejected::EmptySource(cell.clone()))
        );
        assert_eq!(status(&coordinator, &nb, &cell), CellStatus::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let (coordinator, _kernel, nb, cell) = setup("x = 1");

        let first = coordinator.run_cell(&nb, &cell).unwrap();
        assert_eq!(
            coordinator.run_cell(&nb, &cell).err(),
            Some(RunRejected::AlreadyRunning(cell.clone()))
        );
        assert_eq!(first.wait().await, RunOutcome::Completed { execution_count: 1 });
    }

    #[tokio::test]
    async fn test_deleting_cell_mid_run_drops_outcome() {
        let (coordinator, _kernel, nb, cell) = setup("a\nb\nc\nd");

        let handle = coordinator.run_cell(&nb, &cell).unwrap();
        assert!(lock(coordinator.store()).delete_cell(&nb, &cell));

        assert_eq!(handle.wait().await, RunOutcome::Dropped);
        let store = lock(coordinator.store());
        assert!(store.cell(&nb, &cell).is_none());
        assert!(store.notebook(&nb).unwrap().cells.is_empty());
    }

    #[tokio::test]
    async fn test_attach_and_detach_kernel() {
        let (coordinator, kernel, nb, _cell) = setup("x");

        let kernel_id = coordinator.attach_kernel(&nb).await.unwrap();
        {
            let store = lock(coordinator.store());
            let notebook = store.notebook(&nb).unwrap();
            assert_eq!(notebook.kernel_id.as_deref(), Some(kernel_id.as_str()));
            assert_eq!(notebook.kernel_status, KernelStatus::Idle);
            assert_eq!(store.connection(&nb).unwrap().kernel_id(), kernel_id);
        }
        assert_eq!(kernel.open_connections(), 1);

        // Re-attaching closes the superseded connection.
        coordinator.attach_kernel(&nb).await.unwrap();
        assert_eq!(kernel.open_connections(), 1);

        coordinator.detach_kernel(&nb).await.unwrap();
        assert_eq!(kernel.open_connections(), 0);
        assert!(lock(coordinator.store()).notebook(&nb).unwrap().kernel_id.is_none());
    }

    #[tokio::test]
    async fn test_attach_and_detach_during_run_keep_busy() {
        let (coordinator, kernel, nb, cell) = setup("a\nb\nc");
        let run = coordinator.start_run(&nb, &cell).unwrap();
        let kernel_status = || lock(coordinator.store()).notebook(&nb).unwrap().kernel_status;
        assert_eq!(kernel_status(), KernelStatus::Busy);

        coordinator.attach_kernel(&nb).await.unwrap();
        assert_eq!(status(&coordinator, &nb, &cell), CellStatus::Running);
        assert_eq!(kernel_status(), KernelStatus::Busy);

        coordinator.detach_kernel(&nb).await.unwrap();
        assert_eq!(kernel_status(), KernelStatus::Busy);
        assert_eq!(kernel.open_connections(), 0);

        run.drive().await;
        assert_eq!(kernel_status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_detach_without_connection_keeps_status() {
        let (coordinator, kernel, nb, _cell) = setup("x");
        kernel.fail_create(true);
        assert!(coordinator.attach_kernel(&nb).await.is_err());

        coordinator.detach_kernel(&nb).await.unwrap();

        assert_eq!(
            lock(coordinator.store()).notebook(&nb).unwrap().kernel_status,
            KernelStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_attach_unknown_notebook_names_notebook() {
        let (coordinator, _kernel, _nb, _cell) = setup("x");
        let missing = NotebookId::from("missing");

        let err = coordinator.attach_kernel(&missing).await.unwrap_err();

        assert!(matches!(err, BackendError::NotebookNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_attach_failure_marks_kernel_dead() {
        let (coordinator, kernel, nb, _cell) = setup("x");
        kernel.fail_create(true);

        assert!(coordinator.attach_kernel(&nb).await.is_err());
        assert_eq!(
            lock(coordinator.store()).notebook(&nb).unwrap().kernel_status,
            KernelStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_remove_notebook_closes_connection() {
        let (coordinator, kernel, nb, _cell) = setup("x");
        coordinator.attach_kernel(&nb).await.unwrap();

        coordinator.remove_notebook(&nb).await.unwrap();

        assert_eq!(kernel.open_connections(), 0);
        assert!(lock(coordinator.store()).notebook(&nb).is_none());
    }
}
