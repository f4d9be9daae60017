//! Error taxonomy.
//!
//! Three families with different consequences: validation errors reject the
//! offending input and nothing else, protocol errors fail the objective that
//! hit them, integrity errors mean our view and the chain's (or the
//! counterparty's) have diverged and the channel needs manual attention.

use crate::types::{Address, ChannelId};
use thiserror::Error;

/// The input is malformed or stale; drop it, keep all state unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("signature bytes are malformed")]
    MalformedSignature,
    #[error("signature recovers to non-participant {0:?}")]
    SignatureFromNonParticipant(Address),
    #[error("stale turn number: expected {expected}, got {got}")]
    StaleTurnNumber { expected: u32, got: u32 },
    #[error("channel is not known to this engine")]
    UnknownChannel,
    #[error("participant set must hold at least two distinct addresses")]
    InvalidParticipantSet,
    #[error("channel nonce was already used with this participant set")]
    DuplicateChannelNonce,
    #[error("incompatible wallet version: ours {ours}, theirs {theirs}")]
    IncompatibleWalletVersion { ours: u32, theirs: u32 },
    #[error("state belongs to a different channel")]
    WrongChannelId,
    #[error("state content differs from what this participant already signed")]
    InconsistentStateContent,
}

/// The protocol cannot make progress; the affected objective fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("conflicting state signed for the same turn in channel {0:?}")]
    ConflictingSupportedState(ChannelId),
    #[error("ledger lacks the funds requested for channel {0:?}")]
    LedgerInsufficientFunds(ChannelId),
    #[error("channel {0:?} has no supported state to act on")]
    NoSupportedState(ChannelId),
    #[error("counterparty did not respond while waiting on {waiting_on}")]
    CounterpartyTimeout { waiting_on: String },
    #[error("objective {0} already moved funds on chain and cannot be cancelled")]
    IrreversibleObjective(String),
}

/// Our persisted view contradicts an authoritative source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("chain diverged from local view of channel {channel_id:?}: {detail}")]
    ChainDivergence {
        channel_id: ChannelId,
        detail: String,
    },
    #[error("signing identity does not match the configured participant")]
    SignerMismatch,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigError {
    #[error("no signing identity is configured")]
    SigningUnavailable,
    #[error("signature bytes are malformed")]
    MalformedSignature,
}

/// Umbrella error surfaced by the engine's public API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Sig(#[from] SigError),
    #[error("objective {0} is not known to this engine")]
    UnknownObjective(String),
}
