//! REST API surface for remote machine management.
//!
//! The server is a thin router over the [`MachineManager`]: request
//! validation, dispatch, and error-to-status-code mapping live here; all
//! machine semantics live in the manager.
//!
//! [`MachineManager`]: crate::machine::MachineManager

mod handlers;
mod routes;
mod state;
mod types;

use tokio::net::TcpListener;

use crate::MachinaResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use routes::*;
pub use state::*;
pub use types::*;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves the REST API on `addr` until the process exits.
pub async fn serve(addr: &str, state: ServerState) -> MachinaResult<()> {
    let router = create_router(state);
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("machina control plane listening on {}", addr);
    axum::serve(listener, router).await?;

    Ok(())
}
