pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod election;
pub mod elector;
pub mod error;
pub mod logging;
pub mod runner;
pub mod store;

// Re-export common types
pub use cache::{ClockDrift, LeaseCache};
pub use config::ElectionConfig;
pub use election::{Candidacy, LeaderElection};
pub use elector::{QuorumElector, RoundOutcome};
pub use error::{ElectionError, StoreError};
pub use store::{LeaseStore, MemoryLeaseStore, StoreOp};
