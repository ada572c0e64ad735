// src/lib.rs

// Import the top-level `evoloop` module.
pub mod evoloop;

// Re-export the submodules at the crate root so callers write
// `evoloop::sentinel::CreditSentinel` instead of walking the hierarchy.
pub use evoloop::{
    analyst, bus, config, envelope, metrics_log, orchestrator, runtime, sentinel, spawner,
    summary, validator,
};

// Re-exporting key items for easier external access.
pub use evoloop::bus::{BusMessage, MessageBus};
pub use evoloop::orchestrator::EvolutionOrchestrator;
pub use evoloop::runtime::{AgentRuntime, EvolutionAgent};
pub use evoloop::sentinel::{CreditSentinel, Verdict};
