//! Archivum test suite: end-to-end reconstruction scenarios, property-based
//! checks of the replay guarantees, graph lifecycle and restart durability.

pub mod harness;

#[cfg(test)]
mod durability_tests;
#[cfg(test)]
mod proptest_reconstruction;
#[cfg(test)]
mod proptest_retry;

pub use harness::{recon_config, ReconHarness, TestEnv, ADMIN_TENANT};
