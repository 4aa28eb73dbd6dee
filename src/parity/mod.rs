//! Cross-backend parity: shared-seed harness and equivalence checks

pub mod checks;
pub mod harness;

pub use checks::{compare_batch, compare_scalars, EquivalenceReport, BATCH_TOLERANCE, SCALAR_TOLERANCE};
pub use harness::{HarnessConfig, ParityHarness};
