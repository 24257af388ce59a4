//! HTTP request handlers for the REST API.
//!
//! This module implements the handlers for each API endpoint. The handlers
//! coordinate with the MachineManager and map machina error kinds onto
//! transport status codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::{
    state::ServerState,
    types::{
        CreateRequest, CreateResponse, ErrorResponse, ExecRequest, ExecResponse,
        LifecycleResponse, StatusResponse,
    },
};
use crate::MachinaError;

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the POST /create endpoint.
///
/// Reserves a machine and dispatches its provisioning pipeline.
pub async fn create_handler(
    State(state): State<ServerState>,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    match state.manager().create(req.config).await {
        Ok((id, machine_state)) => (
            StatusCode::OK,
            Json(CreateResponse {
                id,
                state: machine_state,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /exec/{id} endpoint.
///
/// Runs a command in the machine's guest.
pub async fn exec_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> impl IntoResponse {
    match state.manager().exec(&id, &req.cmd).await {
        Ok(output) => (StatusCode::OK, Json(ExecResponse { output })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the GET /status/{id} endpoint.
///
/// Queries the machine's guest health.
pub async fn status_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager().status(&id).await {
        Ok(report) => (StatusCode::OK, Json(StatusResponse { ok: *report.ok() })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the GET /sys_info/{id} endpoint.
///
/// Queries the machine's guest metrics.
pub async fn sys_info_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager().sys_info(&id).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /stop/{id} endpoint.
///
/// Stops the machine's hypervisor process.
pub async fn stop_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager().stop(&id).await {
        Ok(machine_state) => (
            StatusCode::OK,
            Json(LifecycleResponse {
                id,
                state: machine_state,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /destroy/{id} endpoint.
///
/// Destroys the machine and removes its on-disk state.
pub async fn destroy_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager().destroy(&id).await {
        Ok(machine_state) => (
            StatusCode::OK,
            Json(LifecycleResponse {
                id,
                state: machine_state,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

/// Maps a machina error kind onto a transport status code and error body.
fn error_response(error: MachinaError) -> axum::response::Response {
    let status = match &error {
        MachinaError::ImageReference(_) | MachinaError::InvalidMachineSpec(_) => {
            StatusCode::BAD_REQUEST
        }
        MachinaError::NotFound(_) => StatusCode::NOT_FOUND,
        MachinaError::NotReady { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
