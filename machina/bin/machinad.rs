//! `machinad` is the machina control-plane daemon.
//!
//! It serves the REST API (`/create`, `/exec/{id}`, `/status/{id}`,
//! `/sys_info/{id}`, `/stop/{id}`, `/destroy/{id}`) and provisions one
//! Firecracker microVM per created machine.
//!
//! ## Usage
//!
//! ```bash
//! machinad --addr 127.0.0.1:8080
//! ```
//!
//! Configuration comes from the environment: `MACHINA_HOME`,
//! `MACHINA_KERNEL_PATH`, `MACHINA_INIT_IMAGE`, `MACHINA_FIRECRACKER_BIN`
//! and `MACHINA_SERVER_ADDR`.

use clap::Parser;
use machina::{
    machine::ManagerConfig,
    server::{self, ServerState},
    utils::get_server_addr,
    MachinaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// machina control-plane daemon.
#[derive(Debug, Parser)]
#[command(name = "machinad", author, about, version)]
struct MachinadArgs {
    /// Address to listen on, overriding MACHINA_SERVER_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MachinaResult<()> {
    tracing_subscriber::fmt::init();

    let args = MachinadArgs::parse();
    let addr = args.addr.unwrap_or_else(get_server_addr);

    let state = ServerState::new(ManagerConfig::from_env());
    server::serve(&addr, state).await?;

    Ok(())
}
