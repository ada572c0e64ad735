// src/evoloop/mod.rs

pub mod analyst;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod metrics_log;
pub mod orchestrator;
pub mod runtime;
pub mod sentinel;
pub mod spawner;
pub mod summary;
pub mod validator;

// Export the two structs most callers start from so they can be reached as
// evoloop::CreditSentinel / evoloop::EvolutionOrchestrator.
pub use orchestrator::EvolutionOrchestrator;
pub use sentinel::CreditSentinel;
