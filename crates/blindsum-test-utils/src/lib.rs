//! Shared fixtures for blindsum tests and benchmarks: deterministic RNGs and
//! ready-made study configurations.

use blindsum::data_types::{Participant, PrivateVector};
use blindsum::session::StudyConfig;
use num_bigint::BigUint;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// A seeded RNG so every test run splits values into the same fragments.
pub fn seeded_rng(seed: u64) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(seed)
}

/// `n` participants named `p0..pn`, with position 0 as the initiator.
pub fn participants(n: usize) -> Vec<Participant> {
    (0..n)
        .map(|i| Participant::new(format!("p{i}"), format!("p{i}@example.com")))
        .collect()
}

/// A study over the given bins with a modulus comfortably above any aggregate
/// the default magnitude bound of 1000 allows.
pub fn study_config(n: usize, bins: &[&str], modulus: u64) -> StudyConfig {
    StudyConfig {
        name: "test-study".to_string(),
        participants: participants(n),
        bins: bins.iter().map(|b| b.to_string()).collect(),
        modulus: BigUint::from(modulus),
        max_abs_value: BigUint::from(1000u32),
        round_deadline: None,
    }
}

/// Builds a private vector from bin/value pairs.
pub fn vector(values: &[(&str, i64)]) -> PrivateVector {
    PrivateVector::from_i64(values)
}
