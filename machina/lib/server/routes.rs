//! Route definitions for the HTTP server.
//!
//! This module sets up the routing for the REST API endpoints.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a new router with all API endpoints configured.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/create", post(handlers::create_handler))
        .route("/exec/{id}", post(handlers::exec_handler))
        .route("/status/{id}", get(handlers::status_handler))
        .route("/sys_info/{id}", get(handlers::sys_info_handler))
        .route("/stop/{id}", post(handlers::stop_handler))
        .route("/destroy/{id}", post(handlers::destroy_handler))
        .with_state(state)
}
