//! Reconstruction of the final aggregate from a complete set of result
//! shares.

use std::collections::{BTreeMap, BTreeSet};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::data_types::{BinTotal, ParticipantId};
use crate::field::FieldParams;

/// Errors raised while reconstructing an aggregate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReconstructError {
    /// The round still has outstanding obligations. Expected while exchange
    /// is ongoing; retry once more messages arrived.
    #[error("study {study}: round {round} is not complete, {outstanding} obligations outstanding")]
    RoundNotComplete {
        /// The study the round belongs to.
        study: Uuid,
        /// 1-based round number.
        round: u32,
        /// Obligations not yet satisfied.
        outstanding: usize,
    },
    /// A bin is missing contributions from one or more owners.
    #[error("study {study}: bin {bin} is missing shares from {missing:?}")]
    IncompleteShareSet {
        /// The study the shares belong to.
        study: Uuid,
        /// First bin with missing contributions.
        bin: String,
        /// Owners whose shares are absent.
        missing: Vec<ParticipantId>,
    },
    /// Two bins were contributed to by different owner sets. This signals a
    /// protocol bug, not a recoverable condition.
    #[error("study {study}: contributing participants differ between bins {first} and {second}")]
    InconsistentParticipantSet {
        /// The study the shares belong to.
        study: Uuid,
        /// Reference bin.
        first: String,
        /// Bin whose contributor set differs from the reference.
        second: String,
    },
}

/// One owner's result shares across all bins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    /// The participant that produced these shares.
    pub owner: ParticipantId,
    /// Result share per bin name.
    pub shares: BTreeMap<String, BigUint>,
}

/// The reconstructed aggregate, ready for the reporting/export layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// The study the aggregate belongs to.
    pub study: Uuid,
    /// Element-wise totals in schema order.
    pub totals: Vec<BinTotal>,
    /// Every participant whose shares entered the aggregate.
    pub contributors: Vec<ParticipantId>,
}

impl AggregateResult {
    /// The total for a bin, if the schema contains it.
    pub fn total(&self, bin: &str) -> Option<&num_bigint::BigInt> {
        self.totals.iter().find(|t| t.bin == bin).map(|t| &t.total)
    }
}

/// Combines every owner's result shares per bin and lifts the sums back into
/// the signed domain.
///
/// Fails with [`ReconstructError::InconsistentParticipantSet`] when two bins
/// were contributed to by different owner sets, and with
/// [`ReconstructError::IncompleteShareSet`] when owners expected by the
/// session are absent. One contribution per owner; a later contribution for
/// the same owner replaces an earlier one.
pub fn reconstruct(
    study: Uuid,
    field: &FieldParams,
    bins: &[String],
    expected: &BTreeSet<ParticipantId>,
    contributions: &[Contribution],
) -> Result<AggregateResult, ReconstructError> {
    let mut by_owner: BTreeMap<ParticipantId, &BTreeMap<String, BigUint>> = BTreeMap::new();
    for contribution in contributions {
        by_owner.insert(contribution.owner, &contribution.shares);
    }

    let mut owner_sets: Vec<(String, BTreeSet<ParticipantId>)> = Vec::with_capacity(bins.len());
    for bin in bins {
        let owners = by_owner
            .iter()
            .filter(|(_, shares)| shares.contains_key(bin))
            .map(|(owner, _)| *owner)
            .collect();
        owner_sets.push((bin.clone(), owners));
    }

    if let Some((first, reference)) = owner_sets.first() {
        for (bin, owners) in &owner_sets[1..] {
            if owners != reference {
                return Err(ReconstructError::InconsistentParticipantSet {
                    study,
                    first: first.clone(),
                    second: bin.clone(),
                });
            }
        }
        if reference != expected {
            let missing = expected.difference(reference).copied().collect();
            return Err(ReconstructError::IncompleteShareSet {
                study,
                bin: first.clone(),
                missing,
            });
        }
    }

    let totals = bins
        .iter()
        .map(|bin| {
            let combined = field.combine(
                by_owner
                    .values()
                    .filter_map(|shares| shares.get(bin)),
            );
            BinTotal {
                bin: bin.clone(),
                total: field.lift(&combined),
            }
        })
        .collect();
    let contributors: Vec<ParticipantId> = expected.iter().copied().collect();
    info!(%study, participants = contributors.len(), "aggregate reconstructed");

    Ok(AggregateResult {
        study,
        totals,
        contributors,
    })
}

#[cfg(test)]
mod tests {
    use num_bigint::BigInt;

    use super::*;

    fn field() -> FieldParams {
        FieldParams::new(BigUint::from(10007u32)).unwrap()
    }

    fn contribution(owner: usize, shares: &[(&str, u32)]) -> Contribution {
        Contribution {
            owner: ParticipantId(owner),
            shares: shares
                .iter()
                .map(|(bin, v)| (bin.to_string(), BigUint::from(*v)))
                .collect(),
        }
    }

    fn expected(n: usize) -> BTreeSet<ParticipantId> {
        (0..n).map(ParticipantId).collect()
    }

    #[test]
    fn sums_each_bin_and_lifts_the_result() {
        let bins = vec!["A".to_string(), "B".to_string()];
        let contributions = vec![
            contribution(0, &[("A", 5), ("B", 10000)]),
            contribution(1, &[("A", 3), ("B", 10)]),
        ];
        let result = reconstruct(
            Uuid::from_u128(1),
            &field(),
            &bins,
            &expected(2),
            &contributions,
        )
        .unwrap();
        assert_eq!(result.total("A"), Some(&BigInt::from(8)));
        // 10000 + 10 wraps to 3, i.e. the owners' signed values were -7 and 10.
        assert_eq!(result.total("B"), Some(&BigInt::from(3)));
        assert_eq!(result.contributors, vec![ParticipantId(0), ParticipantId(1)]);
    }

    #[test]
    fn missing_owner_fails_with_incomplete_share_set() {
        let bins = vec!["A".to_string()];
        let contributions = vec![contribution(0, &[("A", 5)])];
        let err = reconstruct(
            Uuid::from_u128(1),
            &field(),
            &bins,
            &expected(2),
            &contributions,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::IncompleteShareSet { missing, .. }
                if missing == vec![ParticipantId(1)]
        ));
    }

    #[test]
    fn differing_owner_sets_fail_with_inconsistent_participants() {
        let bins = vec!["A".to_string(), "B".to_string()];
        let contributions = vec![
            contribution(0, &[("A", 5), ("B", 1)]),
            contribution(1, &[("A", 3)]),
        ];
        let err = reconstruct(
            Uuid::from_u128(1),
            &field(),
            &bins,
            &expected(2),
            &contributions,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::InconsistentParticipantSet { first, second, .. }
                if first == "A" && second == "B"
        ));
    }
}
