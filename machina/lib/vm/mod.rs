//! Hypervisor configuration rendering and process supervision.

mod config;

/// Spawning and ownership of the external hypervisor process.
pub mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
