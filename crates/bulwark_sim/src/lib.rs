//! BULWARK Simulation
//!
//! Seeded load simulation for the coordination layer: a failure-injecting
//! backend, a workload planner and a harness that replays both against a
//! coordinator on a manual clock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod harness;
pub mod seed;

pub use backend::{BackendProfile, BackendStats, Outage, SimBackend};
pub use harness::{PriorityOutcome, SimConfig, SimError, SimHarness, SimReport, Workload};
pub use seed::{SeedSource, SimSeed};
