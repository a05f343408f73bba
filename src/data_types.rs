//! Data types shared across the aggregation engine.

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// Stable identifier of a participant within a study.
///
/// The participant list is immutable once a study starts, so the position in
/// that list doubles as the wire identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ParticipantId(pub usize);

impl ParticipantId {
    /// The role derived from the position in the exchange topology.
    pub fn role(self) -> Role {
        if self.0 == 0 {
            Role::Initiator
        } else {
            Role::Peer
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A participant in a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Display name, unique within a study.
    pub name: String,
    /// Opaque routing address (mail address, folder, ...) used by the
    /// surrounding transport layer. The engine never interprets it.
    pub contact: String,
}

impl Participant {
    /// Creates a new participant.
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Participant {
            name: name.into(),
            contact: contact.into(),
        }
    }
}

/// The role a participant plays in a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The participant that created the study (position 0).
    Initiator,
    /// Every other participant.
    Peer,
}

/// The message kind exchanged in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundKind {
    /// Round 1: each participant distributes one blinded fragment per bin to
    /// every counterpart.
    ShareDistribution,
    /// Round 2: each participant broadcasts its folded result share.
    ResultBroadcast,
}

impl fmt::Display for RoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundKind::ShareDistribution => write!(f, "share-distribution"),
            RoundKind::ResultBroadcast => write!(f, "result-broadcast"),
        }
    }
}

/// A participant's private per-bin values.
///
/// Held only by its owner and local persistence. Exchange messages carry
/// blinded fragments of these values, never the values themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateVector(BTreeMap<String, BigInt>);

impl PrivateVector {
    /// Creates a vector from bin/value pairs. Later entries overwrite earlier
    /// ones with the same bin name.
    pub fn new(values: impl IntoIterator<Item = (String, BigInt)>) -> Self {
        PrivateVector(values.into_iter().collect())
    }

    /// Convenience constructor for machine-sized values.
    pub fn from_i64(values: &[(&str, i64)]) -> Self {
        PrivateVector(
            values
                .iter()
                .map(|(bin, v)| (bin.to_string(), BigInt::from(*v)))
                .collect(),
        )
    }

    /// The value for a bin, if present.
    pub fn get(&self, bin: &str) -> Option<&BigInt> {
        self.0.get(bin)
    }

    /// Number of bins covered by this vector.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector covers no bins at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over bin/value pairs in bin order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BigInt)> {
        self.0.iter()
    }
}

/// One bin of a reconstructed aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinTotal {
    /// The bin name, as defined by the study schema.
    pub bin: String,
    /// The element-wise sum of all participants' private values for this bin.
    pub total: BigInt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_is_position_zero() {
        assert_eq!(ParticipantId(0).role(), Role::Initiator);
        assert_eq!(ParticipantId(1).role(), Role::Peer);
        assert_eq!(ParticipantId(7).role(), Role::Peer);
    }

    #[test]
    fn private_vector_keeps_last_value_per_bin() {
        let v = PrivateVector::new([
            ("a".to_string(), BigInt::from(1)),
            ("a".to_string(), BigInt::from(2)),
        ]);
        assert_eq!(v.len(), 1);
        assert_eq!(v.get("a"), Some(&BigInt::from(2)));
    }
}
