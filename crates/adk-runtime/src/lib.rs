//! adk-runtime
//!
//! The strategy execution plane:
//! - [`StrategyRunner`]: one isolated execution unit per subscription —
//!   a dedicated OS thread with panic containment, fed through bounded
//!   message queues
//! - [`Supervisor`]: owns every runner; symbol-indexed tick fan-out, health
//!   monitoring with bounded restart backoff, result routing, kill-switch
//!   cascade
//! - [`ExecutionEngine`]: the facade the rest of the platform calls —
//!   lifecycle commands, order routing with a full audit trail, market-data
//!   intake from the broker feed

mod engine;
mod logging;
mod runner;
mod supervisor;
mod types;

pub use engine::{EngineStatus, ExecutionEngine, ExecutionEngineConfig};
pub use logging::init_tracing;
pub use runner::{RunnerHandle, RunnerSpawn};
pub use supervisor::{RestartPolicy, StartSpec, Supervisor, SupervisorStatus};
pub use types::{OrderEnvelope, RunnerCommand, RunnerResult, RunnerStatus};
