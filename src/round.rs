//! Per-round bookkeeping: which exchange obligations exist, which are met,
//! and how the round advances through its lifecycle.
//!
//! A round is tracked from the local session's perspective: it owes one
//! outbound message to every peer and expects one inbound message from every
//! peer. The stored phase only ever moves forward; the stalled condition is
//! derived from the clock when asked for, never persisted.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data_types::{ParticipantId, RoundKind};

/// Stored lifecycle of a round. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundPhase {
    /// No obligation satisfied yet.
    Pending,
    /// Some obligations satisfied.
    InProgress,
    /// Every obligation satisfied.
    Complete,
    /// Terminal: the aggregate has been computed from this round.
    Reconstructed,
}

/// Reported status of a round, including the advisory stalled condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    /// No obligation satisfied yet.
    Pending,
    /// Some obligations satisfied.
    InProgress,
    /// Every obligation satisfied.
    Complete,
    /// Terminal: the aggregate has been computed from this round.
    Reconstructed,
    /// The round deadline elapsed with obligations outstanding. Advisory:
    /// late messages are still accepted.
    Stalled,
}

/// What happened when an inbound message was integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// A new obligation was satisfied.
    Recorded,
    /// The message was an identical retransmission; nothing changed.
    Duplicate,
    /// A differing retransmission replaced the previously stored shares.
    Replaced,
    /// The message belongs to a round the session has not reached yet and
    /// was buffered for later integration.
    Deferred,
}

/// An expected message within a round, with its satisfaction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obligation {
    /// Producer of the expected message.
    pub sender: ParticipantId,
    /// Addressee of the expected message.
    pub recipient: ParticipantId,
    /// Whether the message has been delivered (outbound) or imported
    /// (inbound).
    pub satisfied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OutboundRecord {
    pub(crate) payload: Vec<u8>,
    pub(crate) delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InboundRecord {
    pub(crate) digest: [u8; 32],
    pub(crate) shares: BTreeMap<String, BigUint>,
}

/// State of one round of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundState {
    round: u32,
    kind: RoundKind,
    own: ParticipantId,
    begun_at: SystemTime,
    phase: RoundPhase,
    outbound: BTreeMap<ParticipantId, OutboundRecord>,
    inbound: BTreeMap<ParticipantId, InboundRecord>,
}

impl RoundState {
    /// Creates a round with one outbound payload per peer; the same peers are
    /// expected to send one message each in return.
    pub(crate) fn new(
        round: u32,
        kind: RoundKind,
        own: ParticipantId,
        payloads: BTreeMap<ParticipantId, Vec<u8>>,
        begun_at: SystemTime,
    ) -> Self {
        RoundState {
            round,
            kind,
            own,
            begun_at,
            phase: RoundPhase::Pending,
            outbound: payloads
                .into_iter()
                .map(|(recipient, payload)| {
                    (
                        recipient,
                        OutboundRecord {
                            payload,
                            delivered: false,
                        },
                    )
                })
                .collect(),
            inbound: BTreeMap::new(),
        }
    }

    /// 1-based round number.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// The message kind exchanged in this round.
    pub fn kind(&self) -> RoundKind {
        self.kind
    }

    /// When the round was created.
    pub fn begun_at(&self) -> SystemTime {
        self.begun_at
    }

    /// The stored lifecycle phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Whether every obligation is satisfied.
    pub fn is_complete(&self) -> bool {
        self.phase >= RoundPhase::Complete
    }

    /// Number of obligations still outstanding.
    pub fn outstanding(&self) -> usize {
        let undelivered = self.outbound.values().filter(|o| !o.delivered).count();
        undelivered + self.outbound.len() - self.inbound.len()
    }

    /// All obligations of this round with their satisfaction state, outbound
    /// first.
    pub fn obligations(&self) -> Vec<Obligation> {
        let mut all = Vec::with_capacity(2 * self.outbound.len());
        for (recipient, record) in &self.outbound {
            all.push(Obligation {
                sender: self.own,
                recipient: *recipient,
                satisfied: record.delivered,
            });
        }
        for sender in self.outbound.keys() {
            all.push(Obligation {
                sender: *sender,
                recipient: self.own,
                satisfied: self.inbound.contains_key(sender),
            });
        }
        all
    }

    /// The status to report, deriving [`RoundStatus::Stalled`] from the clock
    /// when a deadline is configured.
    pub fn status(&self, now: SystemTime, deadline: Option<Duration>) -> RoundStatus {
        match self.phase {
            RoundPhase::Complete => RoundStatus::Complete,
            RoundPhase::Reconstructed => RoundStatus::Reconstructed,
            RoundPhase::Pending | RoundPhase::InProgress => {
                if let Some(deadline) = deadline
                    && now
                        .duration_since(self.begun_at)
                        .is_ok_and(|elapsed| elapsed > deadline)
                {
                    return RoundStatus::Stalled;
                }
                if self.phase == RoundPhase::Pending {
                    RoundStatus::Pending
                } else {
                    RoundStatus::InProgress
                }
            }
        }
    }

    /// Whether nothing has happened in this round yet: no delivery marked,
    /// no message imported.
    pub(crate) fn untouched(&self) -> bool {
        self.phase == RoundPhase::Pending
            && self.inbound.is_empty()
            && self.outbound.values().all(|o| !o.delivered)
    }

    pub(crate) fn is_peer(&self, id: ParticipantId) -> bool {
        self.outbound.contains_key(&id)
    }

    /// Encoded payloads not yet marked as delivered.
    pub(crate) fn undelivered(&self) -> Vec<(ParticipantId, Vec<u8>)> {
        self.outbound
            .iter()
            .filter(|(_, record)| !record.delivered)
            .map(|(recipient, record)| (*recipient, record.payload.clone()))
            .collect()
    }

    /// Marks the outbound obligation towards `recipient` as satisfied.
    /// Idempotent: returns `false` when it was already marked.
    pub(crate) fn mark_delivered(&mut self, recipient: ParticipantId) -> bool {
        let record = self
            .outbound
            .get_mut(&recipient)
            .expect("recipient checked by the session");
        if record.delivered {
            return false;
        }
        record.delivered = true;
        debug!(round = self.round, %recipient, "outbound message delivered");
        self.refresh_phase();
        true
    }

    /// Integrates an inbound share set from `sender`.
    ///
    /// Identical retransmissions (same content digest) are ignored; differing
    /// retransmissions replace the stored set and are logged, but completion
    /// criteria are unaffected either way.
    pub(crate) fn accept(
        &mut self,
        sender: ParticipantId,
        digest: [u8; 32],
        shares: BTreeMap<String, BigUint>,
    ) -> ImportOutcome {
        let outcome = match self.inbound.get(&sender) {
            Some(record) if record.digest == digest => {
                debug!(round = self.round, %sender, "identical retransmission ignored");
                return ImportOutcome::Duplicate;
            }
            Some(_) => {
                warn!(
                    round = self.round,
                    %sender,
                    "differing retransmission replaces previously imported shares"
                );
                ImportOutcome::Replaced
            }
            None => ImportOutcome::Recorded,
        };
        self.inbound.insert(sender, InboundRecord { digest, shares });
        self.refresh_phase();
        outcome
    }

    /// Per-sender share sets imported so far.
    pub(crate) fn inbound_shares(
        &self,
    ) -> impl Iterator<Item = (ParticipantId, &BTreeMap<String, BigUint>)> {
        self.inbound.iter().map(|(id, record)| (*id, &record.shares))
    }

    /// Replaces the outbound payloads of a round that has seen no activity.
    pub(crate) fn replace_payloads(&mut self, payloads: BTreeMap<ParticipantId, Vec<u8>>) {
        debug_assert!(self.untouched());
        for (recipient, payload) in payloads {
            self.outbound.insert(
                recipient,
                OutboundRecord {
                    payload,
                    delivered: false,
                },
            );
        }
    }

    /// Marks the terminal phase after the aggregate has been computed.
    pub(crate) fn mark_reconstructed(&mut self) {
        debug_assert!(self.phase >= RoundPhase::Complete);
        if self.phase == RoundPhase::Complete {
            debug!(round = self.round, "round reconstructed");
            self.phase = RoundPhase::Reconstructed;
        }
    }

    fn refresh_phase(&mut self) {
        if self.phase >= RoundPhase::Complete {
            return;
        }
        let delivered = self.outbound.values().filter(|o| o.delivered).count();
        let satisfied = delivered + self.inbound.len();
        if satisfied == 2 * self.outbound.len() {
            debug!(round = self.round, kind = %self.kind, "round complete");
            self.phase = RoundPhase::Complete;
        } else if satisfied > 0 {
            self.phase = RoundPhase::InProgress;
        }
    }
}
