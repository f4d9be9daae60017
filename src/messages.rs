//! Application-level messages exchanged between engines.
//!
//! The transport underneath is assumed to deliver whole messages at least
//! once, with no ordering across channels. Everything in here is therefore
//! safe to re-deliver: signed states merge idempotently, proposals carry
//! nonces, objective proposals dedupe on their id.

use crate::channel::{ChannelConstants, ChannelRole, SignedState};
use crate::consensus::LedgerProposal;
use crate::objective::FundingStrategy;
use crate::types::{Address, ChannelId};
use serde::{Deserialize, Serialize};

/// One inbox delivery: everything a peer wants us to know in one go.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub wallet_version: u32,
    pub signed_states: Vec<SignedState>,
    pub ledger_proposals: Vec<LedgerProposal>,
    pub objectives: Vec<ObjectiveProposal>,
}

impl Message {
    pub fn new(wallet_version: u32) -> Self {
        Message {
            wallet_version,
            ..Message::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signed_states.is_empty()
            && self.ledger_proposals.is_empty()
            && self.objectives.is_empty()
    }
}

/// A message plus its recipient, as produced by the engine's outbox.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AddressedMessage {
    pub to: Address,
    pub message: Message,
}

/// A goal one party asks its counterparties to co-operate on. Carries enough
/// for the recipient to create the referenced channels locally.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ObjectiveProposal {
    OpenChannel {
        constants: ChannelConstants,
        strategy: FundingStrategy,
        /// Application or Ledger; the recipient mirrors the proposer's role.
        role: ChannelRole,
    },
    CloseChannel {
        target: ChannelId,
    },
    /// Fund `joint` through the listed guarantor channels, one per hop, each
    /// backed by the ledger at the same position. Recipients derive their
    /// guarantor setup states locally, so the asset travels along.
    VirtualFunding {
        joint: ChannelConstants,
        guarantors: Vec<ChannelConstants>,
        ledgers: Vec<ChannelId>,
        asset: Address,
    },
}

impl ObjectiveProposal {
    /// The channel this proposal is about.
    pub fn target_channel_id(&self) -> ChannelId {
        match self {
            ObjectiveProposal::OpenChannel { constants, .. } => constants.channel_id(),
            ObjectiveProposal::CloseChannel { target } => *target,
            ObjectiveProposal::VirtualFunding { joint, .. } => joint.channel_id(),
        }
    }
}
