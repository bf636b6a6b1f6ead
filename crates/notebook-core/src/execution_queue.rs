//! Run-many-cells driver.
//!
//! A FIFO of cells with at most one executing entry. Commands arrive over an
//! `mpsc` channel and a processor task starts each run through the
//! [`ExecutionCoordinator`], moving on when the run settles. Cells that were
//! deleted or whose run is rejected are skipped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::cell::CellKind;
use crate::error::QueueClosed;
use crate::execution::{ExecutionCoordinator, RunOutcome};
use crate::id::{CellId, NotebookId};
use crate::store::lock;

/// Status of a queued cell
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellQueueStatus {
    /// Waiting in queue
    Pending,
    /// Currently executing
    Executing,
}

/// A cell in the execution queue
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueuedCell {
    pub notebook_id: NotebookId,
    pub cell_id: CellId,
    pub status: CellQueueStatus,
    /// Position in queue (0 = currently executing or next)
    pub position: usize,
}

/// Snapshot of the queue for UIs.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExecutionQueueState {
    /// Has pending or executing cells
    pub processing: bool,
    pub cells: Vec<QueuedCell>,
    pub executing_cell_id: Option<CellId>,
}

/// Commands sent to the queue processor
#[derive(Debug)]
pub enum QueueCommand {
    Enqueue {
        notebook_id: NotebookId,
        cell_id: CellId,
    },
    /// Drop all pending cells, keep the executing one
    Clear,
    /// The run of `cell_id` settled
    ExecutionDone {
        cell_id: CellId,
        outcome: RunOutcome,
    },
    /// Replies once every earlier command has been handled
    Sync { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    notebook_id: NotebookId,
    cell_id: CellId,
}

/// Pending and executing state, owned by the processor.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    pending: VecDeque<QueueEntry>,
    executing: Option<QueueEntry>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, notebook_id: NotebookId, cell_id: CellId) {
        self.pending.push_back(QueueEntry {
            notebook_id,
            cell_id,
        });
    }

    /// Next cell to execute, if nothing is executing yet.
    pub fn dequeue(&mut self) -> Option<(NotebookId, CellId)> {
        if self.executing.is_some() {
            return None;
        }
        let entry = self.pending.pop_front()?;
        self.executing = Some(entry.clone());
        Some((entry.notebook_id, entry.cell_id))
    }

    /// Mark the executing cell as done. Other IDs are ignored.
    pub fn complete(&mut self, cell_id: &CellId) {
        if self.is_executing(cell_id) {
            self.executing = None;
        }
    }

    /// Remove all pending cells, returning their IDs in queue order.
    pub fn clear_pending(&mut self) -> Vec<CellId> {
        self.pending.drain(..).map(|e| e.cell_id).collect()
    }

    pub fn is_executing(&self, cell_id: &CellId) -> bool {
        self.executing.as_ref().map(|e| &e.cell_id) == Some(cell_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }

    pub fn state(&self) -> ExecutionQueueState {
        let executing = self
            .executing
            .iter()
            .map(|e| (e, CellQueueStatus::Executing));
        let pending = self.pending.iter().map(|e| (e, CellQueueStatus::Pending));
        let cells = executing
            .chain(pending)
            .enumerate()
            .map(|(position, (entry, status))| QueuedCell {
                notebook_id: entry.notebook_id.clone(),
                cell_id: entry.cell_id.clone(),
                status,
                position,
            })
            .collect();

        ExecutionQueueState {
            processing: !self.is_empty(),
            cells,
            executing_cell_id: self.executing.as_ref().map(|e| e.cell_id.clone()),
        }
    }
}

pub type SharedExecutionQueue = Arc<StdMutex<ExecutionQueue>>;

fn lock_queue(queue: &SharedExecutionQueue) -> MutexGuard<'_, ExecutionQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable front end of a running queue processor.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueCommand>,
    coordinator: ExecutionCoordinator,
    state: watch::Receiver<ExecutionQueueState>,
}

impl QueueHandle {
    pub async fn enqueue(
        &self,
        notebook_id: &NotebookId,
        cell_id: &CellId,
    ) -> Result<(), QueueClosed> {
        self.send(QueueCommand::Enqueue {
            notebook_id: notebook_id.clone(),
            cell_id: cell_id.clone(),
        })
        .await
    }

    /// Enqueue every code cell of a notebook in its current order. Returns
    /// the enqueued IDs.
    pub async fn run_all(&self, notebook_id: &NotebookId) -> Result<Vec<CellId>, QueueClosed> {
        let cell_ids: Vec<CellId> = {
            let store = lock(self.coordinator.store());
            store
                .notebook(notebook_id)
                .map(|nb| {
                    nb.cells
                        .iter()
                        .filter(|c| c.kind == CellKind::Code)
                        .map(|c| c.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        info!(
            "[queue] Run all: {} cells of notebook {}",
            cell_ids.len(),
            notebook_id
        );
        for cell_id in &cell_ids {
            self.enqueue(notebook_id, cell_id).await?;
        }
        Ok(cell_ids)
    }

    pub async fn clear(&self) -> Result<(), QueueClosed> {
        self.send(QueueCommand::Clear).await
    }

    pub fn state(&self) -> ExecutionQueueState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionQueueState> {
        self.state.clone()
    }

    /// Wait until every cell enqueued so far has settled or been cleared.
    pub async fn wait_idle(&self) -> Result<(), QueueClosed> {
        let (reply, done) = oneshot::channel();
        self.send(QueueCommand::Sync { reply }).await?;
        done.await.map_err(|_| QueueClosed)?;

        let mut state = self.state.clone();
        state
            .wait_for(|s| !s.processing)
            .await
            .map(|_| ())
            .map_err(|_| QueueClosed)
    }

    async fn send(&self, command: QueueCommand) -> Result<(), QueueClosed> {
        self.tx.send(command).await.map_err(|_| QueueClosed)
    }
}

/// Spawn the queue processor task.
pub fn spawn_queue_processor(coordinator: ExecutionCoordinator) -> QueueHandle {
    let capacity = lock(coordinator.store()).settings().queue_capacity.max(1);
    let (tx, mut rx) = mpsc::channel::<QueueCommand>(capacity);
    let (state_tx, state_rx) = watch::channel(ExecutionQueueState::default());
    let queue: SharedExecutionQueue = Arc::new(StdMutex::new(ExecutionQueue::new()));

    let processor = Processor {
        queue,
        coordinator: coordinator.clone(),
        tx: tx.downgrade(),
        state_tx,
    };
    tokio::spawn(async move {
        info!("[queue] Queue processor started");
        while let Some(command) = rx.recv().await {
            processor.handle(command);
        }
        info!("[queue] Queue processor channel closed");
    });

    QueueHandle {
        tx,
        coordinator,
        state: state_rx,
    }
}

struct Processor {
    queue: SharedExecutionQueue,
    coordinator: ExecutionCoordinator,
    tx: mpsc::WeakSender<QueueCommand>,
    state_tx: watch::Sender<ExecutionQueueState>,
}

impl Processor {
    fn handle(&self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue {
                notebook_id,
                cell_id,
            } => {
                info!("[queue] Enqueue cell: {}", cell_id);
                lock_queue(&self.queue).enqueue(notebook_id, cell_id);
                self.process_next();
            }
            QueueCommand::Clear => {
                let cleared = lock_queue(&self.queue).clear_pending();
                info!("[queue] Cleared {} pending cells", cleared.len());
                self.publish();
            }
            QueueCommand::ExecutionDone { cell_id, outcome } => {
                info!("[queue] Execution done: {} ({:?})", cell_id, outcome);
                lock_queue(&self.queue).complete(&cell_id);
                self.process_next();
            }
            QueueCommand::Sync { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn publish(&self) {
        let state = lock_queue(&self.queue).state();
        self.state_tx.send_replace(state);
    }

    /// Start the next runnable cell, skipping ones that cannot run.
    fn process_next(&self) {
        loop {
            let next = lock_queue(&self.queue).dequeue();
            let Some((notebook_id, cell_id)) = next else {
                break;
            };

            match self.coordinator.run_cell(&notebook_id, &cell_id) {
                Ok(handle) => {
                    info!("[queue] Processing cell: {}", cell_id);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let outcome = handle.wait().await;
                        let Some(tx) = tx.upgrade() else {
                            debug!("[queue] All handles dropped; not reporting {}", cell_id);
                            return;
                        };
                        if tx
                            .send(QueueCommand::ExecutionDone { cell_id, outcome })
                            .await
                            .is_err()
                        {
                            error!("[queue] Processor gone before run completion was reported");
                        }
                    });
                    break;
                }
                Err(reason) => {
                    debug!("[queue] Skipping cell {}: {}", cell_id, reason);
                    lock_queue(&self.queue).complete(&cell_id);
                }
            }
        }
        self.publish();
    }
}
