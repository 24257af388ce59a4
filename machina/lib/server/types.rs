//! Type definitions for the server module.
//!
//! This module contains request and response types used by the REST API
//! endpoints.

use serde::{Deserialize, Serialize};

use crate::machine::{MachineSpec, MachineState};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Request body for the `/create` endpoint.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// The machine specification to provision.
    pub config: MachineSpec,
}

/// Response body for the `/create` endpoint.
#[derive(Debug, Serialize)]
pub struct CreateResponse {
    /// The allocated machine identifier.
    pub id: String,

    /// The machine's state at return time, always `created`.
    pub state: MachineState,
}

/// Request body for the `/exec/{id}` endpoint.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    /// The command argv to run in the guest.
    pub cmd: Vec<String>,
}

/// Response body for the `/exec/{id}` endpoint.
#[derive(Debug, Serialize)]
pub struct ExecResponse {
    /// The command's output text.
    pub output: String,
}

/// Response body for the `/status/{id}` endpoint.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Whether the guest reports itself healthy.
    pub ok: bool,
}

/// Response body for the `/stop/{id}` and `/destroy/{id}` endpoints.
#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    /// The machine identifier.
    pub id: String,

    /// The machine's state after the operation.
    pub state: MachineState,
}

/// Error response returned when an operation fails.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}
