//! Off-chain state-channel coordination engine.
//!
//! Participants exchange signed state updates over channels anchored to an
//! on-chain adjudicator; a state signed by everyone is *supported* and is the
//! only thing anyone may act on. On top of that base layer this crate drives:
//!
//! - direct funding (deposits in participant order, postfund as the receipt),
//! - shared ledger channels updated through a symmetric consensus
//!   sub-protocol, funding other channels without touching the chain,
//! - virtual funding of a joint channel across intermediaries, guarded by
//!   per-hop guarantor channels,
//! - co-operative closing and defunding, challenges as the unilateral
//!   fallback.
//!
//! All of it runs as crash-recoverable [objective]s: pure state machines
//! whose transitions are persisted before any of their effects leave the
//! [engine::Engine]. Integrators feed the engine peer messages and chain
//! events, and wire the produced [messages::AddressedMessage]s and
//! transactions to their transport of choice (see [wire]).

pub mod chain;
pub mod channel;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod messages;
pub mod objective;
pub mod outcome;
pub mod sig;
pub mod store;
pub mod types;
pub mod wire;

pub use chain::{ChainEvent, ChainService, ChainTransaction};
pub use channel::{Channel, ChannelConstants, ChannelRole, SignedState, State};
pub use engine::{ChannelStatus, Engine, EngineConfig, Output};
pub use error::EngineError;
pub use messages::{AddressedMessage, Message};
pub use objective::{FundingStrategy, ObjectiveId, ObjectiveStatus};
pub use sig::Signer;
pub use store::StoreSnapshot;
pub use types::{Address, ChannelId, Destination, Hash, Signature, U256};
