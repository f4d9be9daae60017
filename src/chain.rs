//! Interface to the on-chain adjudicator, treated as an external oracle.
//!
//! The chain only ever tells us things (deposits, challenges, conclusions)
//! or accepts transactions; the engine never mutates chain state locally.
//! Events may arrive more than once and are deduped by
//! (channel, block, kind).

use crate::channel::{AdjudicatorStatus, Channel, SignedState};
use crate::error::IntegrityError;
use crate::types::{Address, ChannelId, Hash, U256};
use core::fmt::Debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

/// Events emitted by the chain oracle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Deposited {
        channel_id: ChannelId,
        asset: Address,
        amount: U256,
        holdings_after: U256,
        block_number: u64,
    },
    ChallengeRegistered {
        channel_id: ChannelId,
        finalizes_at: u64,
        block_number: u64,
    },
    Concluded {
        channel_id: ChannelId,
        block_number: u64,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChainEvent::Deposited { channel_id, .. }
            | ChainEvent::ChallengeRegistered { channel_id, .. }
            | ChainEvent::Concluded { channel_id, .. } => *channel_id,
        }
    }

    fn dedupe_key(&self) -> (ChannelId, u64, u8) {
        match self {
            ChainEvent::Deposited { block_number, .. } => (self.channel_id(), *block_number, 0),
            ChainEvent::ChallengeRegistered { block_number, .. } => {
                (self.channel_id(), *block_number, 1)
            }
            ChainEvent::Concluded { block_number, .. } => (self.channel_id(), *block_number, 2),
        }
    }
}

/// Transactions the engine wants submitted. Declarative: the boundary layer
/// hands them to a [ChainService].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ChainTransaction {
    Deposit {
        channel_id: ChannelId,
        asset: Address,
        amount: U256,
        /// Holdings we expect to already be present; the asset holder
        /// reverts the deposit otherwise, making re-submissions safe.
        expected_held: U256,
    },
    ConcludeAndWithdraw {
        channel_id: ChannelId,
        finalization_proof: SignedState,
    },
    Withdraw {
        channel_id: ChannelId,
    },
    Challenge {
        channel_id: ChannelId,
        candidate: SignedState,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::ConcludeAndWithdraw { channel_id, .. }
            | ChainTransaction::Withdraw { channel_id }
            | ChainTransaction::Challenge { channel_id, .. } => *channel_id,
        }
    }
}

/// The submitting side of the chain oracle.
pub trait ChainService: Debug {
    fn submit_transaction(&self, tx: &ChainTransaction) -> Result<Hash, ChainServiceError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainServiceError {
    #[error("chain client rejected the transaction: {0}")]
    Rejected(String),
    #[error("chain client unavailable")]
    Unavailable,
}

/// Tracks which chain events were already observed.
#[derive(Debug, Default)]
pub struct ChainWatcher {
    seen: Mutex<HashSet<(ChannelId, u64, u8)>>,
}

impl ChainWatcher {
    pub fn new() -> Self {
        ChainWatcher::default()
    }

    /// Record the event; returns false for replays, which callers drop.
    pub fn observe(&self, event: &ChainEvent) -> bool {
        self.seen
            .lock()
            .expect("chain watcher lock poisoned")
            .insert(event.dedupe_key())
    }
}

/// Fold a fresh chain event into the channel's funding / adjudication view.
///
/// Divergence between what the chain says and what the engine assumed is an
/// integrity error: it fails the objectives on the channel rather than being
/// papered over.
pub fn apply_event(channel: &mut Channel, event: &ChainEvent) -> Result<(), IntegrityError> {
    match event {
        ChainEvent::Deposited {
            asset,
            holdings_after,
            ..
        } => {
            let channel_id = channel.channel_id();
            let held = channel.funding.entry(*asset).or_default();
            if *holdings_after < *held {
                return Err(IntegrityError::ChainDivergence {
                    channel_id,
                    detail: format!(
                        "holdings decreased from {} to {} without a withdrawal",
                        held, holdings_after
                    ),
                });
            }
            *held = *holdings_after;
            Ok(())
        }
        ChainEvent::ChallengeRegistered { finalizes_at, .. } => {
            if channel.adjudicator_status == AdjudicatorStatus::Finalized {
                return Err(IntegrityError::ChainDivergence {
                    channel_id: channel.channel_id(),
                    detail: "challenge registered on a finalized channel".into(),
                });
            }
            channel.adjudicator_status = AdjudicatorStatus::Challenged {
                finalizes_at: *finalizes_at,
            };
            Ok(())
        }
        ChainEvent::Concluded { .. } => {
            // A conclusion we did not initiate and cannot explain by a
            // supported final state or a registered challenge means our
            // view of the channel diverged from the chain's.
            let explainable = channel.concluded()
                || matches!(
                    channel.adjudicator_status,
                    AdjudicatorStatus::Challenged { .. }
                );
            channel.adjudicator_status = AdjudicatorStatus::Finalized;
            if explainable {
                Ok(())
            } else {
                Err(IntegrityError::ChainDivergence {
                    channel_id: channel.channel_id(),
                    detail: "channel finalized on-chain while running".into(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConstants, ChannelRole};

    fn channel() -> Channel {
        let constants = ChannelConstants::new(
            1.into(),
            0,
            vec![Address([1; 20]), Address([2; 20])],
            Address::default(),
            60,
        )
        .unwrap();
        Channel::new(constants, 0, ChannelRole::Application)
    }

    #[test]
    fn replayed_events_are_dropped() {
        let watcher = ChainWatcher::new();
        let event = ChainEvent::Deposited {
            channel_id: Hash([1; 32]),
            asset: Address::default(),
            amount: 5.into(),
            holdings_after: 5.into(),
            block_number: 10,
        };
        assert!(watcher.observe(&event));
        assert!(!watcher.observe(&event));
    }

    #[test]
    fn deposits_accumulate_via_holdings_after() {
        let mut ch = channel();
        let channel_id = ch.channel_id();
        apply_event(
            &mut ch,
            &ChainEvent::Deposited {
                channel_id,
                asset: Address::default(),
                amount: 5.into(),
                holdings_after: 5.into(),
                block_number: 1,
            },
        )
        .unwrap();
        apply_event(
            &mut ch,
            &ChainEvent::Deposited {
                channel_id,
                asset: Address::default(),
                amount: 5.into(),
                holdings_after: 10.into(),
                block_number: 2,
            },
        )
        .unwrap();
        assert_eq!(ch.total_funding(), 10.into());
    }

    #[test]
    fn unexplained_conclusion_is_divergence() {
        let mut ch = channel();
        let channel_id = ch.channel_id();
        let err = apply_event(
            &mut ch,
            &ChainEvent::Concluded {
                channel_id,
                block_number: 3,
            },
        )
        .unwrap_err();
        assert!(matches!(err, IntegrityError::ChainDivergence { .. }));
        // The chain's view still wins for status.
        assert_eq!(ch.adjudicator_status, AdjudicatorStatus::Finalized);
    }

    #[test]
    fn challenge_updates_status() {
        let mut ch = channel();
        let channel_id = ch.channel_id();
        apply_event(
            &mut ch,
            &ChainEvent::ChallengeRegistered {
                channel_id,
                finalizes_at: 99,
                block_number: 4,
            },
        )
        .unwrap();
        assert_eq!(
            ch.adjudicator_status,
            AdjudicatorStatus::Challenged { finalizes_at: 99 }
        );
    }
}
