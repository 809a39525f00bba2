//! Process-level wiring for the isolate remote function-execution
//! service: configuration, metrics, the background-task registry and
//! runner pool, and the gRPC servicer that ties them to
//! `isolate-executor`'s orchestration pipeline.

pub mod config;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
pub mod servicer;
