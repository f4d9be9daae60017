//! Objectives: multi-step goals driven to completion by the engine.
//!
//! Every objective type is a small state machine with a pure `crank`
//! function: given a read-only snapshot of the channels it touches, it
//! returns declarative [Effect]s and the condition it is waiting on. The
//! engine persists the transition before dispatching any effect, so a crash
//! between the two only ever causes re-emission, never loss.

use crate::chain::ChainTransaction;
use crate::channel::{Channel, State};
use crate::consensus::{LedgerRequest, RequestKind};
use crate::types::{Address, ChannelId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod close;
pub mod direct_fund;
pub mod ledger_fund;
pub mod virtual_fund;

pub use close::{CloseChannel, DefundChannel};
pub use direct_fund::DirectFunding;
pub use ledger_fund::LedgerFunding;
pub use virtual_fund::VirtualFunding;

/// Stable textual id: objective type plus the channel it is about. One live
/// objective per id; re-proposals merge into the existing one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectiveId(pub String);

impl core::fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ObjectiveId {
    pub fn open(target: ChannelId) -> Self {
        ObjectiveId(format!("OpenChannel-{target:?}"))
    }
    pub fn direct_funding(target: ChannelId) -> Self {
        ObjectiveId(format!("DirectFunding-{target:?}"))
    }
    pub fn ledger_funding(target: ChannelId) -> Self {
        ObjectiveId(format!("LedgerFunding-{target:?}"))
    }
    pub fn virtual_funding(joint: ChannelId) -> Self {
        ObjectiveId(format!("VirtualFunding-{joint:?}"))
    }
    pub fn close(target: ChannelId) -> Self {
        ObjectiveId(format!("CloseChannel-{target:?}"))
    }
    pub fn defund(target: ChannelId) -> Self {
        ObjectiveId(format!("DefundChannel-{target:?}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveStatus {
    /// Proposed (locally or by a peer) but not yet approved here.
    Pending,
    Approved,
    Succeeded,
    Failed(String),
}

impl ObjectiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectiveStatus::Succeeded | ObjectiveStatus::Failed(_))
    }
}

/// What an objective is blocked on. Persisted, never a blocked thread.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WaitingOn {
    Nothing,
    Approval,
    PeerSignature { channel: ChannelId, turn: u32 },
    FundsDeposited,
    LedgerRound,
    ChildObjective(ObjectiveId),
    ChainConfirmation,
}

/// How a channel opened through [OpenChannel] gets funded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum FundingStrategy {
    /// On-chain deposits, ordered by participant index.
    Direct,
    /// An allocation in the given shared ledger channel.
    Ledger(ChannelId),
    /// A separately proposed virtual-funding objective over the same target.
    Virtual,
}

/// A child objective an effect asks the engine to create.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SpawnRequest {
    DirectFunding { target: ChannelId },
    LedgerFunding { target: ChannelId, ledger: ChannelId },
    Defund { target: ChannelId },
}

/// Declarative outcome of a crank. Only the engine boundary executes these.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Sign this state and broadcast it to the channel's participants.
    SignState(State),
    SubmitTransaction(ChainTransaction),
    EnqueueLedgerRequest {
        ledger: ChannelId,
        target: ChannelId,
        kind: RequestKind,
    },
    SpawnObjective(SpawnRequest),
}

/// Read-only view handed to a crank: the target channel, snapshots of every
/// related channel (ledgers, guarantors, joints), the ledger requests this
/// objective may have enqueued, and the status of its child objective.
#[derive(Debug)]
pub struct CrankContext<'a> {
    pub channel: &'a Channel,
    pub related: &'a BTreeMap<ChannelId, Channel>,
    pub requests: &'a [LedgerRequest],
    pub child_status: Option<&'a ObjectiveStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrankOutput {
    pub waiting_on: WaitingOn,
    pub effects: Vec<Effect>,
    pub done: Option<Result<(), String>>,
}

impl CrankOutput {
    pub fn waiting(waiting_on: WaitingOn) -> Self {
        CrankOutput {
            waiting_on,
            effects: vec![],
            done: None,
        }
    }

    pub fn waiting_with(waiting_on: WaitingOn, effects: Vec<Effect>) -> Self {
        CrankOutput {
            waiting_on,
            effects,
            done: None,
        }
    }

    pub fn succeeded() -> Self {
        CrankOutput {
            waiting_on: WaitingOn::Nothing,
            effects: vec![],
            done: Some(Ok(())),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        CrankOutput {
            waiting_on: WaitingOn::Nothing,
            effects: vec![],
            done: Some(Err(reason.into())),
        }
    }
}

/// Where a channel stands on the way to a supported state at `turn`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TurnProgress {
    /// The state does not exist here yet and no template was given; wait for
    /// the peer to send it.
    NeedState,
    /// Sign this state (it exists unsigned by us, or was built from the
    /// template).
    SignIt(State),
    /// Signed by us, waiting for the remaining signatures.
    Waiting,
    Supported,
}

/// Shared stepping rule for prefund/postfund/setup turns.
pub(crate) fn advance_turn(channel: &Channel, turn: u32, template: Option<State>) -> TurnProgress {
    match channel.state_at(turn) {
        None => match template {
            Some(state) => TurnProgress::SignIt(state),
            None => TurnProgress::NeedState,
        },
        Some(ss) if !ss.signed_by(channel.my_index) => TurnProgress::SignIt(ss.state.clone()),
        Some(ss) if !ss.is_supported() => TurnProgress::Waiting,
        Some(_) => TurnProgress::Supported,
    }
}

/// Supervisor over opening one channel: waits for the funding child to do
/// the actual work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpenChannel {
    pub target: ChannelId,
    pub strategy: FundingStrategy,
    pub child: Option<ObjectiveId>,
}

impl OpenChannel {
    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let child = match &self.child {
            Some(child) => child.clone(),
            None => {
                let (child, effects) = match &self.strategy {
                    FundingStrategy::Direct => (
                        ObjectiveId::direct_funding(self.target),
                        vec![Effect::SpawnObjective(SpawnRequest::DirectFunding {
                            target: self.target,
                        })],
                    ),
                    FundingStrategy::Ledger(ledger) => (
                        ObjectiveId::ledger_funding(self.target),
                        vec![Effect::SpawnObjective(SpawnRequest::LedgerFunding {
                            target: self.target,
                            ledger: *ledger,
                        })],
                    ),
                    // The virtual-funding objective is proposed separately
                    // and already exists; just wait for it.
                    FundingStrategy::Virtual => (ObjectiveId::virtual_funding(self.target), vec![]),
                };
                self.child = Some(child.clone());
                return CrankOutput::waiting_with(WaitingOn::ChildObjective(child), effects);
            }
        };

        match ctx.child_status {
            Some(ObjectiveStatus::Succeeded) => CrankOutput::succeeded(),
            Some(ObjectiveStatus::Failed(reason)) => CrankOutput::failed(reason.clone()),
            _ => CrankOutput::waiting(WaitingOn::ChildObjective(child)),
        }
    }
}

/// The per-type machine data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ObjectiveData {
    OpenChannel(OpenChannel),
    DirectFunding(DirectFunding),
    LedgerFunding(LedgerFunding),
    VirtualFunding(VirtualFunding),
    CloseChannel(CloseChannel),
    DefundChannel(DefundChannel),
}

/// One persisted objective.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Objective {
    pub id: ObjectiveId,
    /// The channel this objective is about.
    pub target: ChannelId,
    /// Everyone whose co-operation the objective needs.
    pub participants: Vec<Address>,
    pub status: ObjectiveStatus,
    pub waiting_on: WaitingOn,
    /// Absolute time after which waiting on a peer fails with a timeout.
    pub deadline: Option<u64>,
    /// Soft retries already spent re-nudging the peer before giving up.
    pub retries: u32,
    pub data: ObjectiveData,
}

impl Objective {
    pub fn new(
        id: ObjectiveId,
        target: ChannelId,
        participants: Vec<Address>,
        status: ObjectiveStatus,
        data: ObjectiveData,
    ) -> Self {
        Objective {
            id,
            target,
            participants,
            status,
            waiting_on: WaitingOn::Nothing,
            deadline: None,
            retries: 0,
            data,
        }
    }

    /// Run one transition. Only approved, non-terminal objectives move;
    /// effects are returned for the engine to persist and dispatch.
    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> Vec<Effect> {
        if self.status == ObjectiveStatus::Pending {
            self.waiting_on = WaitingOn::Approval;
            return vec![];
        }
        if self.status.is_terminal() {
            return vec![];
        }

        let out = match &mut self.data {
            ObjectiveData::OpenChannel(data) => data.crank(ctx),
            ObjectiveData::DirectFunding(data) => data.crank(ctx),
            ObjectiveData::LedgerFunding(data) => data.crank(ctx),
            ObjectiveData::VirtualFunding(data) => data.crank(ctx),
            ObjectiveData::CloseChannel(data) => data.crank(ctx),
            ObjectiveData::DefundChannel(data) => data.crank(ctx),
        };

        self.waiting_on = out.waiting_on;
        match out.done {
            Some(Ok(())) => self.status = ObjectiveStatus::Succeeded,
            Some(Err(reason)) => self.status = ObjectiveStatus::Failed(reason),
            None => {}
        }
        out.effects
    }
}
