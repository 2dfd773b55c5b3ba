//! Firecracker driver for `micropod`.
//!
//! Two responsibilities: *process supervision* (spawn, reap, signal) and
//! *API sequencing* (configure the VMM over its Unix API socket, then start
//! it). Both live in [`process`]; [`api`] is the thin HTTP-over-Unix-socket
//! client it drives, grounded in the same `hyper`/`hyperlocal` idiom used by
//! production Firecracker SDKs.

pub mod api;
pub mod dto;
pub mod process;

pub use api::{ApiError, FirecrackerApiClient};
pub use process::{
    Error, FirecrackerProcess, FsConfig, LaunchConfig, NetworkConfig, State, VsockConfig, resolve_binary,
};
