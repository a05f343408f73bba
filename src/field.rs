//! Modular big-integer arithmetic: additive secret splitting and
//! reconstruction over the ring `Z_m`.
//!
//! All values a study exchanges live in `[0, m)` for a modulus `m` that is
//! fixed when the study is configured and identical across participants.
//! Signed inputs are mapped into the ring on entry and lifted back out,
//! centered around zero, after reconstruction.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Errors raised by field parameter validation and share splitting.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FieldError {
    /// The modulus is too small to carry any value at all.
    #[error("modulus {modulus} is trivial, at least 3 is required")]
    TrivialModulus {
        /// The rejected modulus.
        modulus: BigUint,
    },
    /// The modulus cannot hold every aggregate the study could produce.
    #[error("modulus {modulus} must exceed {required} to hold every possible aggregate")]
    ModulusTooSmall {
        /// The configured modulus.
        modulus: BigUint,
        /// The smallest value the modulus must exceed, twice the largest
        /// possible aggregate magnitude.
        required: BigUint,
    },
    /// A value cannot be blinded by fewer than two fragments.
    #[error("cannot split into {count} fragments, at least 2 are required")]
    SplitCountTooSmall {
        /// The rejected fragment count.
        count: usize,
    },
}

/// The modular ring all share arithmetic happens in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldParams {
    modulus: BigUint,
}

impl FieldParams {
    /// Creates field parameters, rejecting moduli below 3.
    pub fn new(modulus: BigUint) -> Result<Self, FieldError> {
        if modulus < BigUint::from(3u8) {
            return Err(FieldError::TrivialModulus { modulus });
        }
        Ok(FieldParams { modulus })
    }

    /// The fixed modulus.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Checks that the modulus can represent every aggregate of `participants`
    /// values each bounded by `max_abs_value` in magnitude.
    ///
    /// The centered lift used by [`FieldParams::lift`] disambiguates signs
    /// only while `m > 2 * participants * max_abs_value`, so anything smaller
    /// fails with [`FieldError::ModulusTooSmall`].
    pub fn check_capacity(
        &self,
        participants: usize,
        max_abs_value: &BigUint,
    ) -> Result<(), FieldError> {
        let required = BigUint::from(2u8) * BigUint::from(participants) * max_abs_value;
        if self.modulus <= required {
            return Err(FieldError::ModulusTooSmall {
                modulus: self.modulus.clone(),
                required,
            });
        }
        Ok(())
    }

    /// Maps a signed value into the ring.
    pub fn encode(&self, value: &BigInt) -> BigUint {
        let m = BigInt::from(self.modulus.clone());
        let mut r = value % &m;
        if r.sign() == Sign::Minus {
            r += &m;
        }
        r.to_biguint().expect("residue is non-negative after reduction")
    }

    /// Lifts a residue back into the signed domain, centered around zero:
    /// residues above `m / 2` map to negative values.
    pub fn lift(&self, residue: &BigUint) -> BigInt {
        let half = &self.modulus >> 1;
        if residue > &half {
            BigInt::from(residue.clone()) - BigInt::from(self.modulus.clone())
        } else {
            BigInt::from(residue.clone())
        }
    }

    /// Adds two residues mod `m`.
    pub fn add(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a + b) % &self.modulus
    }

    /// Splits a residue into `count` fragments that sum to it mod `m`.
    ///
    /// The first `count - 1` fragments are uniform residues and the last one
    /// is computed as the difference, so any strict subset of fragments is
    /// statistically independent of the input.
    pub fn split<R: RngCore + CryptoRng>(
        &self,
        value: &BigUint,
        count: usize,
        rng: &mut R,
    ) -> Result<Vec<BigUint>, FieldError> {
        if count < 2 {
            return Err(FieldError::SplitCountTooSmall { count });
        }
        let mut fragments = Vec::with_capacity(count);
        let mut sum = BigUint::zero();
        for _ in 0..count - 1 {
            let fragment = uniform_residue(rng, &self.modulus);
            sum = self.add(&sum, &fragment);
            fragments.push(fragment);
        }
        fragments.push((value + &self.modulus - sum) % &self.modulus);
        Ok(fragments)
    }

    /// Folds fragments back together: the sum of all fragments mod `m`.
    pub fn combine<'a, I>(&self, fragments: I) -> BigUint
    where
        I: IntoIterator<Item = &'a BigUint>,
    {
        let mut sum = BigUint::zero();
        for fragment in fragments {
            sum = self.add(&sum, fragment);
        }
        sum
    }
}

/// Draws a uniform residue in `[0, modulus)`.
///
/// Rejection sampling on `bits(m)` random bits, with the excess bits of the
/// top byte masked off so the expected number of draws stays below 2.
pub(crate) fn uniform_residue<R: RngCore + CryptoRng>(
    rng: &mut R,
    modulus: &BigUint,
) -> BigUint {
    let bits = modulus.bits();
    let len = bits.div_ceil(8) as usize;
    let mask = 0xffu8 >> (len as u64 * 8 - bits);
    let mut buf = vec![0u8; len];
    loop {
        rng.fill_bytes(&mut buf);
        buf[0] &= mask;
        let candidate = BigUint::from_bytes_be(&buf);
        if &candidate < modulus {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn field(m: u64) -> FieldParams {
        FieldParams::new(BigUint::from(m)).unwrap()
    }

    #[test]
    fn rejects_trivial_modulus() {
        assert!(matches!(
            FieldParams::new(BigUint::from(2u8)),
            Err(FieldError::TrivialModulus { .. })
        ));
    }

    #[test]
    fn capacity_check_requires_headroom_for_signed_lift() {
        let f = field(10007);
        assert!(f.check_capacity(3, &BigUint::from(1000u32)).is_ok());
        assert!(matches!(
            f.check_capacity(3, &BigUint::from(2000u32)),
            Err(FieldError::ModulusTooSmall { .. })
        ));
    }

    #[test]
    fn encode_and_lift_are_inverse_for_small_magnitudes() {
        let f = field(10007);
        for v in [-5003i64, -1, 0, 1, 42, 5003] {
            let v = BigInt::from(v);
            assert_eq!(f.lift(&f.encode(&v)), v);
        }
    }

    #[test]
    fn split_rejects_single_fragment() {
        let f = field(10007);
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        assert!(matches!(
            f.split(&BigUint::from(5u8), 1, &mut rng),
            Err(FieldError::SplitCountTooSmall { count: 1 })
        ));
    }

    #[test]
    fn fragments_recombine_to_the_split_value() {
        let f = field(10007);
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for count in 2..6 {
            let value = BigUint::from(4711u32 % 10007);
            let fragments = f.split(&value, count, &mut rng).unwrap();
            assert_eq!(fragments.len(), count);
            assert_eq!(f.combine(&fragments), value);
        }
    }

    #[test]
    fn uniform_residue_stays_below_modulus() {
        let modulus = BigUint::from(11u8);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for _ in 0..1000 {
            assert!(uniform_residue(&mut rng, &modulus) < modulus);
        }
    }

    #[test]
    fn fragment_distribution_is_close_to_uniform() {
        // With k-1 fragments drawn uniformly, each residue of a small field
        // should appear in the first fragment with roughly equal frequency.
        let modulus = BigUint::from(11u8);
        let f = FieldParams::new(modulus.clone()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let draws = 22_000usize;
        let mut counts = vec![0usize; 11];
        for _ in 0..draws {
            let fragments = f.split(&BigUint::from(7u8), 2, &mut rng).unwrap();
            let first: usize = fragments[0].to_string().parse().unwrap();
            counts[first] += 1;
        }
        let expected = draws / 11;
        for (residue, count) in counts.iter().enumerate() {
            let deviation = count.abs_diff(expected);
            assert!(
                deviation < expected / 4,
                "residue {residue} occurred {count} times, expected ~{expected}"
            );
        }
    }

    proptest! {
        #[test]
        fn combine_of_split_is_identity(
            value in 0u64..1_000_000,
            count in 2usize..8,
            modulus in 1_000_001u64..10_000_000,
        ) {
            let f = field(modulus);
            let mut rng = ChaCha20Rng::seed_from_u64(value ^ modulus);
            let value = BigUint::from(value) % f.modulus();
            let fragments = f.split(&value, count, &mut rng).unwrap();
            prop_assert_eq!(f.combine(&fragments), value);
        }

        #[test]
        fn lift_inverts_encode(value in -1_000_000i64..1_000_000) {
            let f = field(10_000_019);
            let value = BigInt::from(value);
            prop_assert_eq!(f.lift(&f.encode(&value)), value);
        }
    }
}
