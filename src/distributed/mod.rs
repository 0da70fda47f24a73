//! Distributed model-and-replay service (spec §4.G): a rating-sampled
//! model registry exposed over RPC, letting self-play actors fetch
//! opponents and push game results/training data across a fleet of
//! machines.

pub mod client;
pub mod messages;
pub mod registry;
pub mod server;

pub use client::DistributedClient;
pub use registry::ModelRegistry;
