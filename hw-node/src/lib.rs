//! Bootstrapping physical test nodes: power cycle a node through its management controller,
//! wait for its serial console to show it has booted, then converge it to a salt state.
//!
//! The components can be used on their own, [`BootstrapOrchestrator`] ties them together
//! and runs many nodes side by side.

pub mod config;
pub mod console;
pub mod directory;
pub mod orchestrator;
pub mod power;
pub mod readiness;
pub mod salt;
pub mod subprocess;

#[cfg(test)]
mod testing;

pub use config::{BootstrapConfig, ConsoleSettings};
pub use directory::{NodeDirectory, NodeRecord};
pub use orchestrator::{BootstrapOrchestrator, BootstrapOutcome, BootstrapPhase, BootstrapResult};
