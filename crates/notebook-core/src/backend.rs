//! The execution backend the core consumes.
//!
//! A backend can create and delete remote notebooks (kernels), receive cell
//! source updates and execute code. Output produced while executing is pushed
//! into an [`OutputSink`]; completion is signalled by `execute_cell`
//! resolving, not by the sink closing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cell::OutputEvent;
use crate::connection::KernelConnection;
use crate::error::BackendError;
use crate::id::{CellId, NotebookId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCellRequest {
    pub notebook_id: NotebookId,
    pub cell_id: CellId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub notebook_id: NotebookId,
    pub cell_id: CellId,
    pub code: String,
}

/// Sending half of a run's output stream.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push an event. Returns false once the run is no longer listening.
    pub fn emit(&self, event: OutputEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[async_trait]
pub trait KernelBackend: Send + Sync {
    /// Create the remote notebook and its execution context.
    async fn create_notebook(
        &self,
        notebook_id: &NotebookId,
        name: &str,
    ) -> Result<Box<dyn KernelConnection>, BackendError>;

    async fn delete_notebook(&self, notebook_id: &NotebookId) -> Result<(), BackendError>;

    /// Push the cell's current source to the backend before executing it.
    async fn update_cell(&self, request: UpdateCellRequest) -> Result<(), BackendError>;

    /// Execute code, streaming output into `outputs` until the call resolves.
    async fn execute_cell(
        &self,
        request: ExecuteRequest,
        outputs: OutputSink,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_sink_delivers_in_order() {
        let (sink, mut rx) = OutputSink::channel();

        assert!(sink.emit(OutputEvent::stream("a", 1)));
        assert!(sink.emit(OutputEvent::stream("b", 2)));
        drop(sink);

        assert_eq!(rx.recv().await.unwrap().payload.to_text(), "a");
        assert_eq!(rx.recv().await.unwrap().payload.to_text(), "b");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_output_sink_reports_closed_receiver() {
        let (sink, rx) = OutputSink::channel();
        drop(rx);
        assert!(!sink.emit(OutputEvent::stream("lost", 1)));
    }

    #[test]
    fn test_execute_request_serialization() {
        let request = ExecuteRequest {
            notebook_id: NotebookId::from("nb"),
            cell_id: CellId::from("c"),
            code: "x = 1".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["notebook_id"], "nb");
        assert_eq!(json["cell_id"], "c");
        assert_eq!(json["code"], "x = 1");
    }
}
