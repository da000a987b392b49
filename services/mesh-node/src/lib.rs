//! Genesis Mesh node service library.
//!
//! The binary in `main.rs` is a thin wrapper over these modules; they
//! are exposed as a library so integration tests can assemble full
//! nodes in-process.

#![warn(missing_docs)]

pub mod health;
pub mod metrics;
pub mod na_client;
pub mod node;
pub mod state;

pub use metrics::{Metrics, MetricsSnapshot};
pub use na_client::{NaClient, NaError};
pub use node::{Delivery, MeshNode, NodeExit, NodeSeed};
