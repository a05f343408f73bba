//! Wire format for everything a study exchanges.
//!
//! Messages are self-describing JSON so that out-of-order, replayed or
//! forwarded blobs can be validated and routed without external context.
//! Decoders ignore unknown fields, which lets newer peers add fields without
//! breaking older ones; the explicit `version` field gates incompatible
//! revisions. Decoding is a pure parse: integrating a message into a session
//! is a separate, explicit step, so corrupt input can never leave behind
//! partial state.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data_types::{Participant, ParticipantId, RoundKind};

/// Current wire revision. Decoders accept everything up to and including it.
pub const WIRE_VERSION: u32 = 1;

/// Errors raised while decoding exchanged bytes. Decoding never touches
/// session state, so every variant is safe to retry with corrected input.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The bytes are structurally corrupt.
    #[error("message could not be parsed: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The message comes from a future, incompatible wire revision.
    #[error("message has wire version {version}, only versions up to {supported} are supported")]
    UnsupportedVersion {
        /// Version announced by the message.
        version: u32,
        /// Latest version this decoder understands.
        supported: u32,
    },
}

/// One blinded fragment for one bin.
///
/// The fragment is a decimal string so arbitrary field sizes survive JSON
/// without precision loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinShare {
    /// Bin name from the study schema.
    pub bin: String,
    /// Decimal encoding of the fragment residue.
    pub fragment: String,
}

impl BinShare {
    pub(crate) fn new(bin: &str, fragment: &BigUint) -> Self {
        BinShare {
            bin: bin.to_string(),
            fragment: fragment.to_str_radix(10),
        }
    }

    /// Parses the fragment back into a residue. `None` if the field does not
    /// hold a decimal number.
    pub fn fragment_value(&self) -> Option<BigUint> {
        if self.fragment.is_empty() {
            return None;
        }
        BigUint::parse_bytes(self.fragment.as_bytes(), 10)
    }
}

/// The unit of transport: a batch of fragments from one sender to one
/// recipient for one round, plus everything needed to validate and route it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    /// Wire revision, see [`WIRE_VERSION`].
    pub version: u32,
    /// The study this message belongs to.
    pub study: Uuid,
    /// Fingerprint of the session configuration, see [`schema_digest`].
    pub schema: String,
    /// 1-based round number.
    pub round: u32,
    /// The message kind expected in that round.
    pub kind: RoundKind,
    /// Producer of the enclosed fragments.
    pub sender: ParticipantId,
    /// The single participant this batch is addressed to.
    pub recipient: ParticipantId,
    /// One fragment per bin of the study schema.
    pub shares: Vec<BinShare>,
}

impl ExchangeMessage {
    /// Serializes the message for transport.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message structs always serialize")
    }

    /// Parses transported bytes. Purely structural: session-level checks
    /// (study, schema, participants) happen during import.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg: ExchangeMessage = serde_json::from_slice(bytes)?;
        if msg.version > WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                version: msg.version,
                supported: WIRE_VERSION,
            });
        }
        Ok(msg)
    }

    /// Digest of the canonical encoding, used to recognize identical
    /// retransmissions of an already imported message.
    pub fn content_digest(&self) -> [u8; 32] {
        blake3::hash(&self.encode()).into()
    }
}

/// The initial message a study creator sends to every invited participant.
///
/// Carries the full session configuration so peers can join with the same
/// study id, schema and field parameters without any other channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyInvitation {
    /// Wire revision, see [`WIRE_VERSION`].
    pub version: u32,
    /// Identifier the initiator generated for the study.
    pub study: Uuid,
    /// Human-readable study name.
    pub name: String,
    /// The full, ordered participant list.
    pub participants: Vec<Participant>,
    /// The ordered bin schema.
    pub bins: Vec<String>,
    /// Decimal encoding of the field modulus.
    pub modulus: String,
    /// Decimal encoding of the per-participant magnitude bound.
    pub max_abs_value: String,
    /// Optional round deadline in seconds, after which a round reports
    /// itself as stalled.
    pub round_deadline_secs: Option<u64>,
}

impl StudyInvitation {
    /// Serializes the invitation for transport.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message structs always serialize")
    }

    /// Parses transported bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let invitation: StudyInvitation = serde_json::from_slice(bytes)?;
        if invitation.version > WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                version: invitation.version,
                supported: WIRE_VERSION,
            });
        }
        Ok(invitation)
    }
}

/// Fingerprint over everything two sessions must agree on before exchanging
/// shares: study id, bin schema, modulus and participant list.
///
/// Every variable-length component is length-prefixed so distinct
/// configurations can never collide by concatenation.
pub fn schema_digest(
    study: &Uuid,
    bins: &[String],
    modulus: &BigUint,
    participants: &[Participant],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(study.as_bytes());
    for bin in bins {
        hasher.update(&(bin.len() as u64).to_le_bytes());
        hasher.update(bin.as_bytes());
    }
    let modulus = modulus.to_bytes_be();
    hasher.update(&(modulus.len() as u64).to_le_bytes());
    hasher.update(&modulus);
    for participant in participants {
        hasher.update(&(participant.name.len() as u64).to_le_bytes());
        hasher.update(participant.name.as_bytes());
        hasher.update(&(participant.contact.len() as u64).to_le_bytes());
        hasher.update(participant.contact.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ExchangeMessage {
        ExchangeMessage {
            version: WIRE_VERSION,
            study: Uuid::from_u128(0x1234),
            schema: "aa".repeat(32),
            round: 1,
            kind: RoundKind::ShareDistribution,
            sender: ParticipantId(0),
            recipient: ParticipantId(1),
            shares: vec![BinShare::new("A", &BigUint::from(17u8))],
        }
    }

    #[test]
    fn roundtrips_through_bytes() {
        let msg = message();
        let decoded = ExchangeMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let bytes = message().encode();
        let err = ExchangeMessage::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_future_wire_version() {
        let mut msg = message();
        msg.version = WIRE_VERSION + 1;
        let err = ExchangeMessage::decode(&msg.encode()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnsupportedVersion { version, supported }
                if version == WIRE_VERSION + 1 && supported == WIRE_VERSION
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut value = serde_json::to_value(message()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("added_in_v2".to_string(), serde_json::json!(true));
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_eq!(ExchangeMessage::decode(&bytes).unwrap(), message());
    }

    #[test]
    fn fragment_parses_only_decimal() {
        let share = BinShare::new("A", &BigUint::from(123456789u64));
        assert_eq!(share.fragment_value(), Some(BigUint::from(123456789u64)));
        let bad = BinShare {
            bin: "A".into(),
            fragment: "12x".into(),
        };
        assert_eq!(bad.fragment_value(), None);
        let empty = BinShare {
            bin: "A".into(),
            fragment: String::new(),
        };
        assert_eq!(empty.fragment_value(), None);
    }

    #[test]
    fn identical_content_has_identical_digest() {
        assert_eq!(message().content_digest(), message().content_digest());
        let mut other = message();
        other.shares[0].fragment = "18".into();
        assert_ne!(message().content_digest(), other.content_digest());
    }

    #[test]
    fn schema_digest_distinguishes_configurations() {
        let study = Uuid::from_u128(1);
        let participants = vec![
            Participant::new("alice", "alice@example.com"),
            Participant::new("bob", "bob@example.com"),
        ];
        let bins = vec!["A".to_string(), "B".to_string()];
        let digest = schema_digest(&study, &bins, &BigUint::from(10007u32), &participants);
        let other_bins = vec!["AB".to_string()];
        let other = schema_digest(&study, &other_bins, &BigUint::from(10007u32), &participants);
        assert_ne!(digest, other);
    }
}
