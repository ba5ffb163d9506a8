//! Deterministic simulation support.

mod rng;

pub use rng::DeterministicRng;
