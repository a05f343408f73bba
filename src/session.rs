//! The study session: aggregate root owning participants, schema, field
//! parameters and the sequence of rounds.
//!
//! A session is one participant's view of one study. It is created by the
//! initiator ([`StudySession::create`]) or from the initiator's invitation
//! ([`StudySession::join`]), mutated as exchange messages are imported, and
//! never destroyed mid-protocol: [`StudySession::save`] /
//! [`StudySession::load`] snapshot the full state so the surrounding
//! application can stop and resume at any point of an exchange that may span
//! days.
//!
//! The exchange itself is store-and-forward. Nothing in here blocks on a
//! remote peer: the transport layer hands over received blobs via
//! [`StudySession::import_message`] whenever they happen to arrive and ships
//! the blobs returned by [`StudySession::outbound`] whenever it can.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{self, AggregateResult, Contribution, ReconstructError};
use crate::codec::{self, BinShare, DecodeError, ExchangeMessage, StudyInvitation, WIRE_VERSION};
use crate::data_types::{Participant, ParticipantId, PrivateVector, Role, RoundKind};
use crate::field::{FieldError, FieldParams};
use crate::round::{ImportOutcome, RoundPhase, RoundState, RoundStatus};

/// Errors raised while configuring a study or joining one.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SetupError {
    /// The field parameters are unusable, most importantly a modulus too
    /// small for the configured participant count and value bound.
    #[error(transparent)]
    Field(#[from] FieldError),
    /// A study needs at least two participants.
    #[error("study needs at least 2 participants, found {found}")]
    TooFewParticipants {
        /// Number of configured participants.
        found: usize,
    },
    /// Participant names must be unique within a study.
    #[error("participant name {name:?} appears more than once")]
    DuplicateParticipant {
        /// The repeated name.
        name: String,
    },
    /// The bin schema must contain at least one bin.
    #[error("study schema contains no bins")]
    EmptySchema,
    /// Bin names must be unique within a study.
    #[error("bin {bin:?} appears more than once in the schema")]
    DuplicateBin {
        /// The repeated bin name.
        bin: String,
    },
    /// The position picked when joining does not exist.
    #[error("own position {position} is outside the participant list of length {participants}")]
    OwnPositionOutOfRange {
        /// The rejected position.
        position: usize,
        /// Length of the participant list.
        participants: usize,
    },
    /// The private vector does not cover a schema bin.
    #[error("private vector does not cover bin {bin:?}")]
    MissingBinValue {
        /// The uncovered bin.
        bin: String,
    },
    /// The private vector covers a bin the schema does not define.
    #[error("private vector contains unknown bin {bin:?}")]
    UnknownBinValue {
        /// The unknown bin.
        bin: String,
    },
    /// A private value exceeds the magnitude bound every participant agreed
    /// to, which would silently break the modulus capacity guarantee.
    #[error("value for bin {bin:?} exceeds the configured magnitude bound")]
    ValueOutOfBounds {
        /// The offending bin.
        bin: String,
    },
    /// The invitation does not describe a usable study.
    #[error("invitation is inconsistent: {detail}")]
    InvalidInvitation {
        /// What exactly is wrong.
        detail: String,
    },
}

/// Errors raised while importing an exchange message. Every rejection leaves
/// the session state untouched, so the caller can retry with corrected bytes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ImportError {
    /// The raw bytes could not be decoded at all.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The message belongs to a different study.
    #[error("study {expected}: message belongs to study {actual}")]
    WrongStudy {
        /// The session's study id.
        expected: Uuid,
        /// The study id announced by the message.
        actual: Uuid,
    },
    /// The message disagrees with the session's schema, modulus or
    /// participant configuration.
    #[error("study {study}: {detail}")]
    SchemaMismatch {
        /// The session's study id.
        study: Uuid,
        /// What exactly disagrees.
        detail: String,
    },
    /// Sender or recipient is not part of the study.
    #[error("study {study}: participant {id} is not part of the study")]
    ParticipantUnknown {
        /// The session's study id.
        study: Uuid,
        /// The unknown identity.
        id: ParticipantId,
    },
    /// The message is addressed to another participant.
    #[error("study {study}: message for {recipient} cannot be imported by {own}")]
    MisroutedMessage {
        /// The session's study id.
        study: Uuid,
        /// Who the message is addressed to.
        recipient: ParticipantId,
        /// The importing session's identity.
        own: ParticipantId,
    },
    /// The message claims to come from the importing session itself.
    #[error("study {study}, round {round}: unexpected sender {sender}")]
    UnexpectedSender {
        /// The session's study id.
        study: Uuid,
        /// 1-based round number.
        round: u32,
        /// The rejected sender.
        sender: ParticipantId,
    },
    /// A share fragment is not a valid element of the study's field.
    #[error("study {study}: share fragment for bin {bin:?} is not a valid field element")]
    InvalidFragment {
        /// The session's study id.
        study: Uuid,
        /// The offending bin.
        bin: String,
    },
    /// The protocol has no such round.
    #[error("study {study}: round {round} does not exist")]
    UnknownRound {
        /// The session's study id.
        study: Uuid,
        /// The rejected round number.
        round: u32,
    },
}

/// Errors raised while marking an outbound message as delivered.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// The recipient is not a peer of this session.
    #[error("study {study}: {id} is not a peer of this session")]
    UnknownRecipient {
        /// The session's study id.
        study: Uuid,
        /// The rejected recipient.
        id: ParticipantId,
    },
}

/// Errors raised while snapshotting a session to disk or restoring it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PersistError {
    /// The snapshot file could not be read or written.
    #[error("session snapshot could not be read or written: {0}")]
    Io(#[from] std::io::Error),
    /// The snapshot bytes could not be encoded or decoded.
    #[error("session snapshot could not be encoded or decoded: {0}")]
    Codec(#[from] bincode::Error),
}

/// Everything needed to set up a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Human-readable study name.
    pub name: String,
    /// The full, ordered participant list. Position 0 is the initiator.
    pub participants: Vec<Participant>,
    /// The ordered bin schema, shared by all participants.
    pub bins: Vec<String>,
    /// The field modulus. Must exceed twice the largest possible aggregate
    /// magnitude, i.e. `2 * participants * max_abs_value`.
    pub modulus: BigUint,
    /// Bound on the magnitude of every private value.
    pub max_abs_value: BigUint,
    /// After how long a round with unmet obligations reports itself as
    /// stalled. Advisory only.
    pub round_deadline: Option<Duration>,
}

impl StudyConfig {
    fn validate(&self) -> Result<(), SetupError> {
        if self.participants.len() < 2 {
            return Err(SetupError::TooFewParticipants {
                found: self.participants.len(),
            });
        }
        let mut names = BTreeSet::new();
        for participant in &self.participants {
            if !names.insert(&participant.name) {
                return Err(SetupError::DuplicateParticipant {
                    name: participant.name.clone(),
                });
            }
        }
        if self.bins.is_empty() {
            return Err(SetupError::EmptySchema);
        }
        let mut bins = BTreeSet::new();
        for bin in &self.bins {
            if !bins.insert(bin) {
                return Err(SetupError::DuplicateBin { bin: bin.clone() });
            }
        }
        Ok(())
    }

    fn validate_inputs(&self, inputs: &PrivateVector) -> Result<(), SetupError> {
        for bin in &self.bins {
            let Some(value) = inputs.get(bin) else {
                return Err(SetupError::MissingBinValue { bin: bin.clone() });
            };
            if value.magnitude() > &self.max_abs_value {
                return Err(SetupError::ValueOutOfBounds { bin: bin.clone() });
            }
        }
        for (bin, _) in inputs.iter() {
            if !self.bins.contains(bin) {
                return Err(SetupError::UnknownBinValue { bin: bin.clone() });
            }
        }
        Ok(())
    }
}

/// One participant's session for one study.
#[derive(Debug, Serialize, Deserialize)]
pub struct StudySession {
    id: Uuid,
    name: String,
    participants: Vec<Participant>,
    bins: Vec<String>,
    field: FieldParams,
    max_abs_value: BigUint,
    round_deadline: Option<Duration>,
    schema: String,
    own: ParticipantId,
    inputs: PrivateVector,
    /// Own fragment per bin, kept back during share distribution.
    kept: BTreeMap<String, BigUint>,
    /// Own folded result share per bin, built when round 1 completes.
    result_shares: Option<BTreeMap<String, BigUint>>,
    rounds: Vec<RoundState>,
    /// Raw messages for rounds the session has not reached yet.
    deferred: Vec<Vec<u8>>,
}

impl StudySession {
    /// Creates the initiator's session (position 0) and the first round.
    ///
    /// The private vector is split immediately: one blinded fragment per bin
    /// is kept back and the remaining fragments are packaged into one
    /// outbound message per peer.
    pub fn create<R: RngCore + CryptoRng>(
        config: StudyConfig,
        inputs: PrivateVector,
        rng: &mut R,
    ) -> Result<Self, SetupError> {
        let study = Uuid::new_v4();
        Self::build(study, config, ParticipantId(0), inputs, rng)
    }

    /// Creates a peer's session from the initiator's invitation.
    pub fn join<R: RngCore + CryptoRng>(
        invitation: &StudyInvitation,
        own_position: usize,
        inputs: PrivateVector,
        rng: &mut R,
    ) -> Result<Self, SetupError> {
        let modulus = BigUint::parse_bytes(invitation.modulus.as_bytes(), 10).ok_or_else(|| {
            SetupError::InvalidInvitation {
                detail: format!("modulus {:?} is not a decimal number", invitation.modulus),
            }
        })?;
        let max_abs_value = BigUint::parse_bytes(invitation.max_abs_value.as_bytes(), 10)
            .ok_or_else(|| SetupError::InvalidInvitation {
                detail: format!(
                    "magnitude bound {:?} is not a decimal number",
                    invitation.max_abs_value
                ),
            })?;
        if own_position >= invitation.participants.len() {
            return Err(SetupError::OwnPositionOutOfRange {
                position: own_position,
                participants: invitation.participants.len(),
            });
        }
        let config = StudyConfig {
            name: invitation.name.clone(),
            participants: invitation.participants.clone(),
            bins: invitation.bins.clone(),
            modulus,
            max_abs_value,
            round_deadline: invitation.round_deadline_secs.map(Duration::from_secs),
        };
        Self::build(
            invitation.study,
            config,
            ParticipantId(own_position),
            inputs,
            rng,
        )
    }

    fn build<R: RngCore + CryptoRng>(
        study: Uuid,
        config: StudyConfig,
        own: ParticipantId,
        inputs: PrivateVector,
        rng: &mut R,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let field = FieldParams::new(config.modulus.clone())?;
        field.check_capacity(config.participants.len(), &config.max_abs_value)?;
        config.validate_inputs(&inputs)?;

        let participants = config.participants;
        let bins = config.bins;
        let schema = codec::schema_digest(&study, &bins, field.modulus(), &participants);

        let mut kept = BTreeMap::new();
        let mut per_recipient: BTreeMap<ParticipantId, Vec<BinShare>> = (0..participants.len())
            .map(ParticipantId)
            .filter(|id| *id != own)
            .map(|id| (id, Vec::with_capacity(bins.len())))
            .collect();
        for bin in &bins {
            let value = inputs.get(bin).expect("inputs validated against schema");
            let residue = field.encode(value);
            let fragments = field.split(&residue, participants.len(), rng)?;
            for (position, fragment) in fragments.into_iter().enumerate() {
                let id = ParticipantId(position);
                if id == own {
                    kept.insert(bin.clone(), fragment);
                } else {
                    per_recipient
                        .get_mut(&id)
                        .expect("all non-own positions present")
                        .push(BinShare::new(bin, &fragment));
                }
            }
        }

        let mut session = StudySession {
            id: study,
            name: config.name,
            participants,
            bins,
            field,
            max_abs_value: config.max_abs_value,
            round_deadline: config.round_deadline,
            schema,
            own,
            inputs,
            kept,
            result_shares: None,
            rounds: Vec::with_capacity(2),
            deferred: Vec::new(),
        };
        let payloads = session.encode_payloads(1, RoundKind::ShareDistribution, per_recipient);
        session.rounds.push(RoundState::new(
            1,
            RoundKind::ShareDistribution,
            own,
            payloads,
            SystemTime::now(),
        ));
        info!(study = %session.id, own = %own, "study session created");
        Ok(session)
    }

    /// The study id shared by all participants.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The study name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered participant list.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// The ordered bin schema.
    pub fn bins(&self) -> &[String] {
        &self.bins
    }

    /// The field parameters shared by all participants.
    pub fn field(&self) -> &FieldParams {
        &self.field
    }

    /// This session's identity.
    pub fn own_id(&self) -> ParticipantId {
        self.own
    }

    /// This session's role in the study.
    pub fn role(&self) -> Role {
        self.own.role()
    }

    /// The invitation to send to every invited participant so they can join
    /// with the same study id, schema and field parameters.
    pub fn invitation(&self) -> StudyInvitation {
        StudyInvitation {
            version: WIRE_VERSION,
            study: self.id,
            name: self.name.clone(),
            participants: self.participants.clone(),
            bins: self.bins.clone(),
            modulus: self.field.modulus().to_str_radix(10),
            max_abs_value: self.max_abs_value.to_str_radix(10),
            round_deadline_secs: self.round_deadline.map(|d| d.as_secs()),
        }
    }

    /// The round the exchange is currently in.
    pub fn current_round(&self) -> &RoundState {
        self.rounds.last().expect("sessions start with round 1")
    }

    /// All rounds so far, oldest first.
    pub fn rounds(&self) -> &[RoundState] {
        &self.rounds
    }

    /// Status of the current round, deriving the stalled condition from
    /// `now` and the configured deadline.
    pub fn round_status(&self, now: SystemTime) -> RoundStatus {
        self.current_round().status(now, self.round_deadline)
    }

    /// Whether the protocol has terminated and the aggregate was computed.
    pub fn finished(&self) -> bool {
        self.rounds.len() == 2 && self.rounds[1].phase() == RoundPhase::Reconstructed
    }

    /// Encoded messages of the current round not yet marked as delivered,
    /// ready to be shipped by the transport layer.
    pub fn outbound(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        self.current_round().undelivered()
    }

    /// Marks the current round's outbound message towards `recipient` as
    /// delivered. Idempotent.
    pub fn mark_delivered(&mut self, recipient: ParticipantId) -> Result<(), DeliveryError> {
        if !self.current_round().is_peer(recipient) {
            return Err(DeliveryError::UnknownRecipient {
                study: self.id,
                id: recipient,
            });
        }
        let round = self.rounds.last_mut().expect("sessions start with round 1");
        round.mark_delivered(recipient);
        self.advance();
        Ok(())
    }

    /// Validates a decoded message against the session without mutating any
    /// state. Useful for transports that want to pre-check blobs.
    pub fn validate_message(&self, msg: &ExchangeMessage) -> Result<(), ImportError> {
        if msg.study != self.id {
            return Err(ImportError::WrongStudy {
                expected: self.id,
                actual: msg.study,
            });
        }
        if msg.schema != self.schema {
            return Err(ImportError::SchemaMismatch {
                study: self.id,
                detail: "message schema fingerprint does not match the session".to_string(),
            });
        }
        let participants = self.participants.len();
        if msg.sender.0 >= participants {
            return Err(ImportError::ParticipantUnknown {
                study: self.id,
                id: msg.sender,
            });
        }
        if msg.recipient.0 >= participants {
            return Err(ImportError::ParticipantUnknown {
                study: self.id,
                id: msg.recipient,
            });
        }
        if msg.recipient != self.own {
            return Err(ImportError::MisroutedMessage {
                study: self.id,
                recipient: msg.recipient,
                own: self.own,
            });
        }
        if msg.sender == self.own {
            return Err(ImportError::UnexpectedSender {
                study: self.id,
                round: msg.round,
                sender: msg.sender,
            });
        }
        let expected_kind = match msg.round {
            1 => RoundKind::ShareDistribution,
            2 => RoundKind::ResultBroadcast,
            _ => {
                return Err(ImportError::UnknownRound {
                    study: self.id,
                    round: msg.round,
                });
            }
        };
        if msg.kind != expected_kind {
            return Err(ImportError::SchemaMismatch {
                study: self.id,
                detail: format!(
                    "round {} carries {} messages, not {}",
                    msg.round, expected_kind, msg.kind
                ),
            });
        }
        Ok(())
    }

    /// Imports one exchange message.
    ///
    /// Decoding and validation are pure; only a fully validated message
    /// mutates the session. Messages for a round the session has not reached
    /// yet are buffered and integrated once the round begins. When the last
    /// obligation of round 1 is satisfied, the result round is started
    /// automatically.
    pub fn import_message(&mut self, bytes: &[u8]) -> Result<ImportOutcome, ImportError> {
        let msg = ExchangeMessage::decode(bytes)?;
        self.validate_message(&msg)?;
        let shares = self.checked_shares(&msg)?;

        let index = (msg.round - 1) as usize;
        if index >= self.rounds.len() {
            debug!(
                study = %self.id,
                round = msg.round,
                sender = %msg.sender,
                "message deferred until its round begins"
            );
            self.deferred.push(bytes.to_vec());
            return Ok(ImportOutcome::Deferred);
        }

        let outcome = self.rounds[index].accept(msg.sender, msg.content_digest(), shares);
        if outcome == ImportOutcome::Replaced && index == 0 {
            self.refresh_result_round();
        }
        self.advance();
        Ok(outcome)
    }

    /// The final aggregate, once every obligation of the result round is
    /// satisfied.
    ///
    /// Retryable with [`ReconstructError::RoundNotComplete`] while exchange
    /// is ongoing. On success the result round transitions to its terminal
    /// reconstructed phase.
    pub fn current_aggregate(&mut self) -> Result<AggregateResult, ReconstructError> {
        let Some(result_round) = self.rounds.get(1) else {
            return Err(ReconstructError::RoundNotComplete {
                study: self.id,
                round: 1,
                outstanding: self.rounds[0].outstanding(),
            });
        };
        if !result_round.is_complete() {
            return Err(ReconstructError::RoundNotComplete {
                study: self.id,
                round: 2,
                outstanding: result_round.outstanding(),
            });
        }

        let own_shares = self
            .result_shares
            .clone()
            .expect("result shares exist once round 2 exists");
        let mut contributions = vec![Contribution {
            owner: self.own,
            shares: own_shares,
        }];
        for (sender, shares) in result_round.inbound_shares() {
            contributions.push(Contribution {
                owner: sender,
                shares: shares.clone(),
            });
        }
        let expected: BTreeSet<ParticipantId> =
            (0..self.participants.len()).map(ParticipantId).collect();
        let result = aggregate::reconstruct(
            self.id,
            &self.field,
            &self.bins,
            &expected,
            &contributions,
        )?;
        self.rounds[1].mark_reconstructed();
        Ok(result)
    }

    /// Snapshots the session to `path`, atomically replacing any previous
    /// snapshot.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let bytes = bincode::serialize(self)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path).map_err(|e| PersistError::Io(e.error))?;
        debug!(study = %self.id, path = %path.display(), "session snapshot written");
        Ok(())
    }

    /// Restores a session from a snapshot written by [`StudySession::save`].
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let bytes = fs::read(path)?;
        let session: StudySession = bincode::deserialize(&bytes)?;
        info!(study = %session.id, own = %session.own, "session snapshot restored");
        Ok(session)
    }

    /// Converts and checks a message's shares: every schema bin exactly once,
    /// every fragment a residue of the study's field.
    fn checked_shares(
        &self,
        msg: &ExchangeMessage,
    ) -> Result<BTreeMap<String, BigUint>, ImportError> {
        let mut shares = BTreeMap::new();
        for share in &msg.shares {
            if !self.bins.contains(&share.bin) {
                return Err(ImportError::SchemaMismatch {
                    study: self.id,
                    detail: format!("share for unknown bin {:?}", share.bin),
                });
            }
            let Some(fragment) = share.fragment_value() else {
                return Err(ImportError::InvalidFragment {
                    study: self.id,
                    bin: share.bin.clone(),
                });
            };
            if &fragment >= self.field.modulus() {
                return Err(ImportError::InvalidFragment {
                    study: self.id,
                    bin: share.bin.clone(),
                });
            }
            if shares.insert(share.bin.clone(), fragment).is_some() {
                return Err(ImportError::SchemaMismatch {
                    study: self.id,
                    detail: format!("duplicate share for bin {:?}", share.bin),
                });
            }
        }
        if shares.len() != self.bins.len() {
            return Err(ImportError::SchemaMismatch {
                study: self.id,
                detail: format!(
                    "message covers {} of {} schema bins",
                    shares.len(),
                    self.bins.len()
                ),
            });
        }
        Ok(shares)
    }

    fn encode_payloads(
        &self,
        round: u32,
        kind: RoundKind,
        per_recipient: BTreeMap<ParticipantId, Vec<BinShare>>,
    ) -> BTreeMap<ParticipantId, Vec<u8>> {
        per_recipient
            .into_iter()
            .map(|(recipient, shares)| {
                let msg = ExchangeMessage {
                    version: WIRE_VERSION,
                    study: self.id,
                    schema: self.schema.clone(),
                    round,
                    kind,
                    sender: self.own,
                    recipient,
                    shares,
                };
                (recipient, msg.encode())
            })
            .collect()
    }

    /// Starts the result round once share distribution completed.
    fn advance(&mut self) {
        if self.rounds.len() == 1 && self.rounds[0].is_complete() {
            self.begin_result_round();
        }
    }

    fn begin_result_round(&mut self) {
        let result_shares = self.fold_result_shares();
        let payloads = self.result_payloads(&result_shares);
        self.result_shares = Some(result_shares);
        self.rounds.push(RoundState::new(
            2,
            RoundKind::ResultBroadcast,
            self.own,
            payloads,
            SystemTime::now(),
        ));
        info!(study = %self.id, "share distribution complete, result broadcast begun");

        for bytes in mem::take(&mut self.deferred) {
            match self.import_message(&bytes) {
                Ok(outcome) => debug!(study = %self.id, ?outcome, "deferred message integrated"),
                Err(err) => warn!(study = %self.id, %err, "deferred message no longer valid"),
            }
        }
    }

    /// Folds the kept fragment with every imported fragment per bin.
    fn fold_result_shares(&self) -> BTreeMap<String, BigUint> {
        let round = &self.rounds[0];
        self.bins
            .iter()
            .map(|bin| {
                let mut sum = self
                    .kept
                    .get(bin)
                    .expect("kept fragments cover the schema")
                    .clone();
                for (_, shares) in round.inbound_shares() {
                    let fragment = shares.get(bin).expect("bin coverage checked at import");
                    sum = self.field.add(&sum, fragment);
                }
                (bin.clone(), sum)
            })
            .collect()
    }

    fn result_payloads(
        &self,
        result_shares: &BTreeMap<String, BigUint>,
    ) -> BTreeMap<ParticipantId, Vec<u8>> {
        let shares: Vec<BinShare> = self
            .bins
            .iter()
            .map(|bin| {
                BinShare::new(
                    bin,
                    result_shares.get(bin).expect("folded over the schema"),
                )
            })
            .collect();
        let per_recipient = (0..self.participants.len())
            .map(ParticipantId)
            .filter(|id| *id != self.own)
            .map(|id| (id, shares.clone()))
            .collect();
        self.encode_payloads(2, RoundKind::ResultBroadcast, per_recipient)
    }

    /// Rebuilds the result shares after a differing round 1 retransmission,
    /// but only while the result round has seen no activity. Anything later
    /// and the previously published result share must stand.
    fn refresh_result_round(&mut self) {
        if self.rounds.len() < 2 {
            return;
        }
        if self.rounds[1].untouched() {
            let result_shares = self.fold_result_shares();
            let payloads = self.result_payloads(&result_shares);
            self.result_shares = Some(result_shares);
            self.rounds[1].replace_payloads(payloads);
            info!(study = %self.id, "result shares rebuilt from replaced fragments");
        } else {
            warn!(
                study = %self.id,
                "replaced fragments arrived after the result share was published, keeping it"
            );
        }
    }
}

/// Shared, mutex-guarded access to one session.
///
/// Imports and delivery marks for the same study must not interleave, so all
/// mutation goes through one lock. Independent studies get independent
/// handles and run concurrently without contention.
#[derive(Debug, Clone)]
pub struct StudyHandle(Arc<Mutex<StudySession>>);

impl StudyHandle {
    /// Wraps a session for shared use.
    pub fn new(session: StudySession) -> Self {
        StudyHandle(Arc::new(Mutex::new(session)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StudySession> {
        self.0.lock().expect("session mutex poisoned")
    }

    /// See [`StudySession::import_message`].
    pub fn import_message(&self, bytes: &[u8]) -> Result<ImportOutcome, ImportError> {
        self.lock().import_message(bytes)
    }

    /// See [`StudySession::mark_delivered`].
    pub fn mark_delivered(&self, recipient: ParticipantId) -> Result<(), DeliveryError> {
        self.lock().mark_delivered(recipient)
    }

    /// See [`StudySession::outbound`].
    pub fn outbound(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        self.lock().outbound()
    }

    /// See [`StudySession::current_aggregate`].
    pub fn current_aggregate(&self) -> Result<AggregateResult, ReconstructError> {
        self.lock().current_aggregate()
    }

    /// See [`StudySession::round_status`].
    pub fn round_status(&self, now: SystemTime) -> RoundStatus {
        self.lock().round_status(now)
    }

    /// See [`StudySession::save`].
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        self.lock().save(path)
    }

    /// Runs a closure against the locked session, for reads that have no
    /// dedicated accessor here.
    pub fn with<T>(&self, f: impl FnOnce(&StudySession) -> T) -> T {
        f(&self.lock())
    }
}

/// Errors raised by [`simulate_exchange`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SimulateError {
    /// A session could not be set up.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// A ferried message was rejected.
    #[error(transparent)]
    Import(#[from] ImportError),
    /// A delivery mark was rejected.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    /// Reconstruction failed.
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
    /// One private vector per participant is required.
    #[error("got {inputs} private vectors for {participants} participants")]
    InputCountMismatch {
        /// Number of provided vectors.
        inputs: usize,
        /// Number of configured participants.
        participants: usize,
    },
}

/// Runs a full exchange with every participant in-process and returns each
/// session's reconstructed aggregate.
///
/// Sessions talk through plain byte buffers, so this exercises the same wire
/// path as a real deployment. Intended for tests, benchmarks and examples.
pub fn simulate_exchange<R: RngCore + CryptoRng>(
    config: StudyConfig,
    inputs: Vec<PrivateVector>,
    rng: &mut R,
) -> Result<Vec<AggregateResult>, SimulateError> {
    if inputs.len() != config.participants.len() {
        return Err(SimulateError::InputCountMismatch {
            inputs: inputs.len(),
            participants: config.participants.len(),
        });
    }
    let mut inputs = inputs.into_iter();
    let initiator =
        StudySession::create(config, inputs.next().expect("count checked above"), rng)?;
    let invitation = initiator.invitation();
    let mut sessions = vec![initiator];
    for (position, input) in inputs.enumerate() {
        sessions.push(StudySession::join(&invitation, position + 1, input, rng)?);
    }

    loop {
        let mut traffic = Vec::new();
        for session in &sessions {
            let from = session.own_id();
            for (to, payload) in session.outbound() {
                traffic.push((from, to, payload));
            }
        }
        if traffic.is_empty() {
            break;
        }
        for (from, to, payload) in traffic {
            sessions[from.0].mark_delivered(to)?;
            sessions[to.0].import_message(&payload)?;
        }
    }

    sessions
        .iter_mut()
        .map(|session| session.current_aggregate().map_err(SimulateError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn config(participants: usize) -> StudyConfig {
        StudyConfig {
            name: "unit".to_string(),
            participants: (0..participants)
                .map(|i| Participant::new(format!("p{i}"), format!("p{i}@example.com")))
                .collect(),
            bins: vec!["A".to_string(), "B".to_string()],
            modulus: BigUint::from(10007u32),
            max_abs_value: BigUint::from(1000u32),
            round_deadline: None,
        }
    }

    fn inputs() -> PrivateVector {
        PrivateVector::from_i64(&[("A", 5), ("B", -2)])
    }

    #[test]
    fn rejects_single_participant_studies() {
        let cfg = config(1);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert!(matches!(
            StudySession::create(cfg, inputs(), &mut rng),
            Err(SetupError::TooFewParticipants { found: 1 })
        ));
    }

    #[test]
    fn rejects_undersized_modulus() {
        let mut cfg = config(3);
        cfg.modulus = BigUint::from(6000u32);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert!(matches!(
            StudySession::create(cfg, inputs(), &mut rng),
            Err(SetupError::Field(FieldError::ModulusTooSmall { .. }))
        ));
    }

    #[test]
    fn rejects_inputs_outside_the_agreed_bound() {
        let cfg = config(3);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let too_big = PrivateVector::from_i64(&[("A", 1001), ("B", 0)]);
        assert!(matches!(
            StudySession::create(cfg, too_big, &mut rng),
            Err(SetupError::ValueOutOfBounds { bin }) if bin == "A"
        ));
    }

    #[test]
    fn rejects_incomplete_private_vectors() {
        let cfg = config(3);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let partial = PrivateVector::from_i64(&[("A", 1)]);
        assert!(matches!(
            StudySession::create(cfg, partial, &mut rng),
            Err(SetupError::MissingBinValue { bin }) if bin == "B"
        ));
    }

    #[test]
    fn create_prepares_one_message_per_peer() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let session = StudySession::create(config(3), inputs(), &mut rng).unwrap();
        let outbound = session.outbound();
        assert_eq!(outbound.len(), 2);
        let recipients: Vec<_> = outbound.iter().map(|(to, _)| *to).collect();
        assert_eq!(recipients, vec![ParticipantId(1), ParticipantId(2)]);
        assert_eq!(session.role(), Role::Initiator);
    }

    #[test]
    fn aggregate_before_completion_is_round_not_complete() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut session = StudySession::create(config(3), inputs(), &mut rng).unwrap();
        let err = session.current_aggregate().unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::RoundNotComplete {
                round: 1,
                outstanding: 4,
                ..
            }
        ));
    }

    #[test]
    fn join_adopts_the_initiators_study_id_and_schema() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let initiator = StudySession::create(config(3), inputs(), &mut rng).unwrap();
        let invitation = initiator.invitation();
        let peer = StudySession::join(&invitation, 1, inputs(), &mut rng).unwrap();
        assert_eq!(peer.id(), initiator.id());
        assert_eq!(peer.bins(), initiator.bins());
        assert_eq!(peer.role(), Role::Peer);
    }

    #[test]
    fn join_rejects_positions_outside_the_participant_list() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let initiator = StudySession::create(config(3), inputs(), &mut rng).unwrap();
        let invitation = initiator.invitation();
        assert!(matches!(
            StudySession::join(&invitation, 3, inputs(), &mut rng),
            Err(SetupError::OwnPositionOutOfRange { position: 3, .. })
        ));
    }
}
