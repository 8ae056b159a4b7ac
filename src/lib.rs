//! Iris measurement control plane
//!
//! Iris coordinates geographically distributed agents that run a
//! high-rate prober under the direction of a central controller. This
//! crate is the control plane: the agent measurement loop, the worker
//! round pipeline, the measurement registry and the bus and object-store
//! adapters. The HTTP API, the prober binary and the backing services
//! (Redis, ClickHouse, S3) are external collaborators.

pub mod agent;
pub mod bus;
pub mod config;
pub mod controller;
pub mod probes;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod targets;
pub mod tools;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use agent::Agent;
pub use bus::Bus;
pub use config::{AgentSettings, CommonSettings, RetryPolicy, WorkerSettings};
pub use controller::Controller;
pub use registry::{forge_table_name, parse_table_name, Registry};
pub use storage::Storage;
pub use types::*;
pub use worker::Worker;
