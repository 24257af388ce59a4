//! Server state management.
//!
//! This module provides the ServerState type which holds the shared
//! MachineManager instance used by every HTTP request handler.

use std::sync::Arc;

use crate::machine::{MachineManager, ManagerConfig};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared server state containing the machine manager.
#[derive(Clone)]
pub struct ServerState {
    /// The shared machine manager instance.
    manager: Arc<MachineManager>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates a new server state around a manager built from `config`.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            manager: Arc::new(MachineManager::new(config)),
        }
    }

    /// Gets a reference to the machine manager.
    pub fn manager(&self) -> &Arc<MachineManager> {
        &self.manager
    }
}
