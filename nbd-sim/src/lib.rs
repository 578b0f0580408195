//! Test fixtures for nbd-client.
//!
//! Kept separate from the client crate so the simulated server and its
//! async stack are never compiled into the library.
//!
//! ## Crate Structure
//!
//! - `backend` - Export storage, including fault injection
//! - `server` - A configurable NBD server running on its own thread
//! - `harness` - Simulation harnesses and oracles for correctness verification
//! - `simulation` - Seeded simulation runners

pub mod backend;
pub mod harness;
pub mod server;
pub mod simulation;

pub use backend::{Backend, BackendError, FaultyBackend, MemoryBackend};
pub use harness::{NbdAction, NbdHarness, NbdOracle, NbdStats, SimulationError};
pub use server::{
    ExportSpec, Greeting, LoggedRequest, ServerConfig, ServerLog, ServerThread, SimServer,
    spawn_server,
};
pub use simulation::{get_seed, init_tracing, run_nbd_simulation};
