//! Orchestration tier for the isolate remote function-execution service.
//!
//! Everything a binary needs to run the build -> connect -> dispatch ->
//! drain pipeline described by the service's design lives here; the
//! gRPC surface itself (and the process bootstrap that wires these
//! pieces to a listening socket) lives in `isolate-server`.

pub mod bridge;
pub mod bridge_manager;
pub mod environment;
pub mod error;
pub mod queue;
pub mod runner;
pub mod task;
