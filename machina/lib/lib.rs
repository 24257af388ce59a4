//! `machina` is a control plane that turns container-image references into
//! running Firecracker microVMs, one microVM per workload.
//!
//! # Overview
//!
//! machina orchestrates an external hypervisor process per machine. It
//! handles:
//! - Machine lifecycle management
//! - Container image pulls and layer extraction
//! - Root filesystem image assembly
//! - Hypervisor configuration and process supervision
//! - A narrow in-guest command/query channel over vsock
//!
//! # Architecture
//!
//! A machine moves through a four-stage provisioning pipeline, run on an
//! independent task per machine:
//!
//! 1. **Extract**: the image reference is resolved against its registry and
//!    its layers are materialized into a directory, last layer winning.
//! 2. **Build**: the extracted tree becomes a fixed-size ext4 block image
//!    through battle-tested external tools (`dd`, `mkfs.ext4`, `mount`,
//!    `cp`, `umount`), with the mount released on every exit path.
//! 3. **Configure**: the declarative firecracker boot document (boot
//!    source, drives, machine shape, network, vsock) is rendered.
//! 4. **Supervise**: the hypervisor binary is spawned bound to the
//!    machine's control socket; the machine is `Running` once the process
//!    is up.
//!
//! Once running, the guest agent is reachable through [`guest::GuestChannel`]
//! for `exec`, `status` and `sysinfo` round trips.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use machina::{
//!     machine::{GuestSpec, MachineManager, MachineSpec, ManagerConfig},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = MachineManager::new(ManagerConfig::from_env());
//!
//!     let spec = MachineSpec::builder()
//!         .image("alpine:latest")
//!         .guest(GuestSpec::builder().cpus(2).memory_mb(2048).build())
//!         .build();
//!
//!     let (id, state) = manager.create(spec).await?;
//!     println!("machine {} is {}", id, state);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`guest`] - Guest control-channel client
//! - [`machine`] - Machine identity, specs and the lifecycle state machine
//! - [`oci`] - Image references, registry pulls and layer extraction
//! - [`rootfs`] - Filesystem image assembly
//! - [`server`] - REST API server implementation
//! - [`utils`] - Common utilities and helpers
//! - [`vm`] - Hypervisor configuration and supervision
//!
//! # Known gaps
//!
//! OCI whiteout/opaque-directory semantics are deliberately not implemented;
//! images that rely on inter-layer deletions extract with the marker files
//! intact.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod guest;
pub mod machine;
pub mod oci;
pub mod rootfs;
pub mod server;
pub mod utils;
pub mod vm;

pub use error::*;
