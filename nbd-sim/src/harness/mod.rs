//! Simulation harnesses for nbd-client.
//!
//! Harnesses provide the infrastructure for running seeded simulations:
//! - Oracle implementations for correctness verification
//! - Action generators for random operation sequences
//! - Statistics tracking

pub mod nbd;

pub use nbd::{NbdAction, NbdHarness, NbdOracle, NbdStats};

use thiserror::Error;

/// Error type for simulation failures.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("oracle mismatch: {context}")]
    Mismatch { context: String },

    #[error("harness used before init")]
    NotInitialized,

    #[error("client error: {0}")]
    Client(#[from] nbd_client::Error),

    #[error("server error: {0}")]
    Server(#[from] nbd_client::NbdError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
