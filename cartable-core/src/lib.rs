//! Core types and federation wiring for the cartable school-life aggregator.

/// Federation tuning shared by every account manager.
pub mod config;
/// Pure grade aggregation: subject averages, global average and influence.
pub mod grades;
/// Shared HTTP helpers used by provider crates.
pub mod http;
/// Domain models and identifiers shared by all providers.
pub mod model;
/// Registry resolving provider kinds to plugin factories.
pub mod plugin;
/// Traits describing the provider contract and the collaborator ports.
pub mod ports;
/// Account-level facade fanning capability requests out to linked providers.
pub mod service;
/// Session state machine wrapping every provider call.
pub mod session;
/// Ready-made collaborator implementations.
pub mod store;

pub use config::*;
pub use model::*;
pub use plugin::*;
pub use ports::*;
pub use service::*;
pub use session::*;
pub use store::*;
