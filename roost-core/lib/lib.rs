//! `roost-core` is the server lifecycle engine of the roost node daemon.
//!
//! # Overview
//!
//! roost manages a pool of container-hosted game servers on a single physical
//! host on behalf of a central control panel. This crate contains everything
//! that touches the host:
//!
//! - Per-server state machine, power-action serialization and crash recovery
//! - A chroot-like sandboxed filesystem with disk-quota accounting
//! - Archive compression and extraction under the same sandbox discipline
//! - A uniform environment adapter over the Docker container runtime
//! - Backup creation/restoration and server-to-server transfers
//! - The client for the panel's remote API
//!
//! # Modules
//!
//! - [`config`] - Node configuration types and the immutable snapshot handle
//! - [`environment`] - Container runtime adapter and its event publishers
//! - [`filesystem`] - Safe-path resolution, quota ledger and archive engine
//! - [`server`] - Server object, manager, power controller and crash handler
//! - [`remote`] - Panel API client
//! - [`backup`] - Streaming backup create/restore
//! - [`transfer`] - Server-to-server data transfers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod backup;
pub mod config;
pub mod environment;
pub mod filesystem;
pub mod remote;
pub mod server;
pub mod transfer;

pub use error::*;
