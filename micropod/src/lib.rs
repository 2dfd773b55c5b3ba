//! Firecracker-backed micro-VM container runtime.
//!
//! `micropod` pulls an OCI image, provisions a rootfs and a NAT'd tap
//! network, boots a Firecracker microVM, and (for the flat-directory
//! strategy) asks the guest agent over vsock to start the image's entry
//! process. [`Controller`] is the entry point; everything else in this
//! crate is its supporting state.
//!
//! ```no_run
//! use micropod::{Config, Controller};
//!
//! # async fn run() -> micropod::Result<()> {
//! let controller = Controller::open(Config::resolve())?;
//! let id = controller.run_vm("library/alpine:latest", &[], Default::default()).await?;
//! controller.stop_vm(&id).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;
mod id;
mod registry;
mod vsock;

pub use config::Config;
pub use controller::Controller;
pub use error::{Error, Result};
pub use id::gen_id;
pub use registry::{NetworkRecord, Registry, RootfsRecord, VMRecord, VmLifecycleState};
pub use vsock::AgentClient;

pub use micropod_rootfs::Strategy;
