//! Steward Deterministic Simulation
//!
//! An in-memory network with seeded latency, partitions and crashes, and a
//! harness that runs a named cluster of members on it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod harness;
pub mod network;
pub mod seed;

#[cfg(test)]
mod scenarios;

pub use harness::{SimCluster, SimConfig, SimError};
pub use network::{Latency, NetworkStats, SimNetwork};
pub use seed::{SeedSource, SimSeed};
