//! In-process kernel backend.
//!
//! Streams one `stream` event per non-empty source line, then an
//! `execute_result`, pausing `event_delay` before each event. Code containing
//! the failure marker produces an `error` event and a rejected execution.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;

use crate::backend::{ExecuteRequest, KernelBackend, OutputSink, UpdateCellRequest};
use crate::cell::{OutputEvent, OutputKind, OutputPayload};
use crate::connection::KernelConnection;
use crate::error::BackendError;
use crate::id::NotebookId;

#[derive(Debug, Clone)]
pub struct SimulatedKernelConfig {
    pub event_delay: Duration,
    pub failure_marker: String,
}

impl Default for SimulatedKernelConfig {
    fn default() -> Self {
        Self {
            event_delay: Duration::from_millis(10),
            failure_marker: "raise".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatedKernel {
    config: SimulatedKernelConfig,
    fail_updates: AtomicBool,
    fail_create: AtomicBool,
    execution_counter: AtomicUsize,
    open_connections: Arc<AtomicUsize>,
}

impl SimulatedKernel {
    pub fn new(config: SimulatedKernelConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Make every following `update_cell` call fail.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make every following `create_notebook` call fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Connections handed out and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.config.event_delay.is_zero() {
            tokio::time::sleep(self.config.event_delay).await;
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct SimulatedConnection {
    kernel_id: String,
    closed: bool,
    open_connections: Arc<AtomicUsize>,
}

impl KernelConnection for SimulatedConnection {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl KernelBackend for SimulatedKernel {
    async fn create_notebook(
        &self,
        notebook_id: &NotebookId,
        name: &str,
    ) -> Result<Box<dyn KernelConnection>, BackendError> {
        self.pause().await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "cannot start kernel for {}",
                notebook_id
            )));
        }
        let kernel_id = format!("sim-{}", uuid::Uuid::new_v4());
        info!(
            "[sim] Started kernel {} for notebook {} ({:?})",
            kernel_id, notebook_id, name
        );
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedConnection {
            kernel_id,
            closed: false,
            open_connections: self.open_connections.clone(),
        }))
    }

    async fn delete_notebook(&self, notebook_id: &NotebookId) -> Result<(), BackendError> {
        debug!("[sim] Deleted remote notebook {}", notebook_id);
        Ok(())
    }

    async fn update_cell(&self, request: UpdateCellRequest) -> Result<(), BackendError> {
        self.pause().await;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!(
                "update of cell {} refused",
                request.cell_id
            )));
        }
        Ok(())
    }

    async fn execute_cell(
        &self,
        request: ExecuteRequest,
        outputs: OutputSink,
    ) -> Result<(), BackendError> {
        let count = self.execution_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut lines = 0;

        for line in request.code.lines().filter(|l| !l.trim().is_empty()) {
            self.pause().await;
            if line.contains(self.config.failure_marker.as_str()) {
                let evalue = line.trim().to_string();
                outputs.emit(OutputEvent::new(
                    OutputKind::Error,
                    OutputPayload::Data(json!({
                        "ename": "SimulatedError",
                        "evalue": evalue,
                    })),
                    now_millis(),
                ));
                return Err(BackendError::Rejected(format!(
                    "SimulatedError: {}",
                    evalue
                )));
            }
            outputs.emit(OutputEvent::stream(format!("{}\n", line), now_millis()));
            lines += 1;
        }

        self.pause().await;
        outputs.emit(OutputEvent::new(
            OutputKind::ExecuteResult,
            OutputPayload::Data(json!({
                "text/plain": format!("Out[{}]: {} line(s)", count, lines),
            })),
            now_millis(),
        ));
        Ok(())
    }
}
