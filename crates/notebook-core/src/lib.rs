//! notebook-core - In-memory notebook and cell state for a notebook front end.
//!
//! The crate owns the authoritative state of every open notebook: the ordered
//! cells, their outputs and execution status, which notebook and cell are
//! active, and the live kernel connection of each notebook.
//!
//! - [`store::NotebookStore`] applies every mutation synchronously under one
//!   lock and broadcasts a [`store::StoreEvent`] for each change.
//! - [`execution::ExecutionCoordinator`] runs cells against a
//!   [`backend::KernelBackend`] and reconciles streamed output back into the
//!   store, dropping events for cells that were deleted or re-run meanwhile.
//! - [`execution_queue`] runs many cells one after another.
//! - [`reorder::apply_drop`] turns a drag gesture into a move by cell ID.

pub mod backend;
pub mod cell;
pub mod connection;
pub mod error;
pub mod execution;
pub mod execution_queue;
pub mod id;
pub mod notebook;
pub mod reorder;
pub mod settings;
pub mod simulated_kernel;
pub mod store;

pub use backend::{ExecuteRequest, KernelBackend, OutputSink, UpdateCellRequest};
pub use cell::{
    Cell, CellDraft, CellKind, CellPatch, CellStatus, OutputEvent, OutputKind, OutputPayload,
};
pub use connection::{KernelConnection, Superseded};
pub use error::{BackendError, QueueClosed, RunRejected, StoreError};
pub use execution::{ExecutionCoordinator, RunHandle, RunOutcome};
pub use execution_queue::{spawn_queue_processor, ExecutionQueueState, QueueHandle};
pub use id::{CellId, NotebookId, RunId};
pub use notebook::{KernelStatus, Notebook, NotebookPatch, NotebookSummary};
pub use reorder::{apply_drop, DropInstruction, DropOutcome};
pub use settings::{OutputPolicy, Settings};
pub use simulated_kernel::{SimulatedKernel, SimulatedKernelConfig};
pub use store::{lock, NotebookStore, SharedStore, StoreEvent};
