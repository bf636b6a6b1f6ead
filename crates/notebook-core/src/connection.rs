//! Live kernel connection handles, at most one per notebook.
//!
//! The registry never closes a handle by itself. Replacing or removing an
//! entry hands the previous handle back as a [`Superseded`] value, and the
//! caller is responsible for closing it.

use std::collections::HashMap;
use std::fmt;

use crate::id::NotebookId;

/// A live connection to a backend execution context.
pub trait KernelConnection: Send + fmt::Debug {
    fn kernel_id(&self) -> &str;

    /// Release the underlying transport. Called exactly once by the owner.
    fn close(&mut self);
}

/// A connection that was removed from the registry and must be closed.
#[must_use = "superseded connections must be closed"]
#[derive(Debug)]
pub struct Superseded(Box<dyn KernelConnection>);

impl Superseded {
    /// Wrap a handle that could not be registered.
    pub(crate) fn orphaned(connection: Box<dyn KernelConnection>) -> Self {
        Superseded(connection)
    }

    pub fn kernel_id(&self) -> &str {
        self.0.kernel_id()
    }

    pub fn close(mut self) {
        log::info!("[conn] Closing connection to kernel {}", self.0.kernel_id());
        self.0.close();
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<NotebookId, Box<dyn KernelConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection` for `notebook_id`, returning the one it replaces.
    pub fn register(
        &mut self,
        notebook_id: NotebookId,
        connection: Box<dyn KernelConnection>,
    ) -> Option<Superseded> {
        self.connections
            .insert(notebook_id, connection)
            .map(Superseded)
    }

    pub fn take(&mut self, notebook_id: &NotebookId) -> Option<Superseded> {
        self.connections.remove(notebook_id).map(Superseded)
    }

    pub fn get(&self, notebook_id: &NotebookId) -> Option<&dyn KernelConnection> {
        self.connections.get(notebook_id).map(|c| c.as_ref())
    }
}
