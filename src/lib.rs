//! Control-plane core of a serverless function runtime built on microVMs.
//!
//! This crate owns the mapping from VM identifiers to running hypervisor
//! subprocesses and their control sockets, drives the hypervisor control-socket HTTP
//! protocol through boot/pause/snapshot/resume/restore, maintains a pool of
//! pre-started idle VMMs for fast snapshot restoration, and arbitrates warm /
//! snapshot-restore / cold invocation modes and per-invocation memory resizing.
//!
//! The function catalog, snapshot store, and network provisioning are external
//! collaborators consumed through the narrow interfaces in [`function`] and
//! [`snapshot`]; this crate never constructs concrete instances of them.

pub mod balloon;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod function;
pub mod guest_client;
pub mod hypervisor_client;
pub mod id;
pub mod machine;
pub mod network;
pub mod process_spawner;
pub mod retry;
pub mod snapshot;
pub mod supervisor;

pub use controller::VmController;
pub use daemon::DaemonState;
pub use error::{ControllerError, HypervisorError};
pub use id::{SnapshotId, VmId};
pub use machine::{Machine, MachineState};
