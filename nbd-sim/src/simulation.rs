//! Simulation runners and utilities.
//!
//! A run is reproducible from its seed: the seed picks the server's reply
//! style and the operation sequence. Set `DST_SEED` to replay a failure.
//!
//! ```bash
//! # PR-level quick run
//! cargo test -p nbd-sim simulation
//!
//! # Nightly long-running run
//! DST_SEED=1234 cargo test -p nbd-sim simulation -- --ignored
//! ```

use tracing::info;

use crate::harness::{NbdHarness, SimulationError};

/// Run an NBD simulation with the given seed and number of operations.
pub fn run_nbd_simulation(
    seed: u64,
    size_bytes: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    info!(seed, size_bytes, operations, "NBD simulation");

    let mut harness = NbdHarness::new(seed, size_bytes);
    harness.init()?;
    harness.run(operations)?;
    harness.finish()?;

    info!(stats = ?harness.stats(), "NBD simulation complete");
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}

/// Install a test-friendly subscriber honouring `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
