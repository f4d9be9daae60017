//! Ledger consensus sub-protocol.
//!
//! Either party of a shared ledger may propose an updated allocation at any
//! time; both follow the same algorithm so an agreed update is signed within
//! two round trips:
//!
//!  i. If I have not proposed yet: apply all pending defunds, then as many
//!     pending funds as the ledger affords (in deterministic order), and
//!     send the resulting outcome as my proposal.
//! ii. Once both proposals are known: if they are equal, sign. Otherwise
//!     sign the merge — the intersection of both sides' asks redistributed
//!     over the supported outcome. An empty merge dismisses both proposals
//!     and the round restarts with fresh nonces.
//!
//! The crank below is pure: it looks at a scoped snapshot and emits exactly
//! one declarative action. The objective runtime persists whatever the
//! action implies and routes the produced state through the normal signing
//! path.

use crate::channel::{Channel, State, StateVars};
use crate::error::ProtocolError;
use crate::outcome::{Allocation, AllocationItem, Outcome};
use crate::types::{Address, ChannelId};
use serde::{Deserialize, Serialize};

/// Whether a request adds funds behind a channel or reclaims them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Fund,
    Defund,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One party's outstanding ask against a shared ledger. Serialized through
/// the ledger's turn-taking together with everyone else's asks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerRequest {
    pub ledger_channel_id: ChannelId,
    pub channel_to_be_funded: ChannelId,
    pub kind: RequestKind,
    pub status: RequestStatus,
    /// Rounds this request was passed over while pending. Above the
    /// configured threshold it jumps the queue, so nothing starves.
    pub missed_opportunities: u32,
}

impl LedgerRequest {
    pub fn new(ledger_channel_id: ChannelId, channel_to_be_funded: ChannelId, kind: RequestKind) -> Self {
        LedgerRequest {
            ledger_channel_id,
            channel_to_be_funded,
            kind,
            status: RequestStatus::Pending,
            missed_opportunities: 0,
        }
    }
}

/// A candidate ledger outcome, exchanged between the two ledger parties.
/// Nonces only grow; replays and stale counter-proposals are dropped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerProposal {
    pub ledger_channel_id: ChannelId,
    pub outcome: Allocation,
    pub nonce: u64,
    pub proposer: Address,
}

/// A pending request joined with the data the crank needs about its target:
/// the per-destination contributions to move in or out of the ledger.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: LedgerRequest,
    /// Contribution items: what each destination puts behind (or gets back
    /// from) the target channel.
    pub items: Vec<AllocationItem>,
    /// The target channel's nonce; gives all ledger parties the same
    /// deterministic request ordering without a shared clock.
    pub target_nonce: u64,
}

/// Everything the crank looks at, loaded under the ledger channel's lease.
#[derive(Debug)]
pub struct LedgerSnapshot<'a> {
    pub ledger: &'a Channel,
    pub my_proposal: Option<&'a LedgerProposal>,
    pub their_proposal: Option<&'a LedgerProposal>,
    pub pending: &'a [PendingRequest],
}

/// The single step the caller should take next.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerAction {
    /// Send this proposal to the counterparty (and remember it as ours).
    Propose(LedgerProposal),
    /// Sign this ledger state; both sides computed the same outcome.
    SignUpdate(State),
    /// Both proposals cancelled out; clear them and start a fresh round.
    Dismiss,
    /// These targets did not fit into the ledger this round. They stay
    /// pending and their missed-opportunity count goes up.
    MarkInsufficient(Vec<ChannelId>),
    /// The supported outcome now reflects these requests.
    MarkComplete {
        funded: Vec<ChannelId>,
        defunded: Vec<ChannelId>,
    },
    Nothing,
}

/// Policy knobs. The exact numbers are configuration, not protocol.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusConfig {
    /// Pending requests passed over this many rounds escalate to the front
    /// of the queue.
    pub starvation_threshold: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            starvation_threshold: 3,
        }
    }
}

/// Run one step of the consensus algorithm for a ledger with pending
/// requests.
pub fn crank(
    snapshot: &LedgerSnapshot<'_>,
    config: &ConsensusConfig,
) -> Result<LedgerAction, ProtocolError> {
    if snapshot.pending.is_empty() {
        return Ok(LedgerAction::Nothing);
    }

    let supported = match snapshot.ledger.supported() {
        Some(ss) => ss,
        None => return Ok(LedgerAction::Nothing),
    };
    let supported_outcome = supported
        .state
        .vars
        .outcome
        .as_allocation()
        .ok_or(ProtocolError::LedgerInsufficientFunds(
            snapshot.ledger.channel_id(),
        ))?
        .clone();
    let supported_turn = supported.state.turn_num();

    if let Some(action) = mark_requests_complete(snapshot, &supported_outcome) {
        return Ok(action);
    }

    match (snapshot.my_proposal, snapshot.their_proposal) {
        (Some(mine), Some(theirs)) => exchange_signed_states(
            snapshot,
            &supported_outcome,
            supported_turn,
            mine,
            theirs,
            config,
        ),
        _ => Ok(exchange_proposals(snapshot, &supported_outcome, config)),
    }
}

/// Requests already satisfied by the supported outcome are done: a fund
/// request once the ledger pays the target, a defund request once it no
/// longer does.
fn mark_requests_complete(
    snapshot: &LedgerSnapshot<'_>,
    supported: &Allocation,
) -> Option<LedgerAction> {
    let mut funded = vec![];
    let mut defunded = vec![];
    for pending in snapshot.pending {
        let target = pending.request.channel_to_be_funded;
        let present = supported.amount_for(target.into()).is_some();
        match pending.request.kind {
            RequestKind::Fund if present => funded.push(target),
            RequestKind::Defund if !present => defunded.push(target),
            _ => {}
        }
    }
    if funded.is_empty() && defunded.is_empty() {
        None
    } else {
        Some(LedgerAction::MarkComplete { funded, defunded })
    }
}

/// Deterministic processing order shared by both ledger parties: starved
/// requests first, then by target channel nonce, ties broken by channel id.
fn ordered<'p>(
    pending: &'p [PendingRequest],
    kind: RequestKind,
    config: &ConsensusConfig,
) -> Vec<&'p PendingRequest> {
    let mut of_kind: Vec<&PendingRequest> = pending
        .iter()
        .filter(|p| p.request.kind == kind && p.request.status == RequestStatus::Pending)
        .collect();
    of_kind.sort_by_key(|p| {
        (
            p.request.missed_opportunities < config.starvation_threshold,
            p.target_nonce,
            p.request.channel_to_be_funded,
        )
    });
    of_kind
}

/// Apply defunds, then as many funds as fit, to the supported outcome.
/// Returns the candidate and the targets that did not fit.
fn build_candidate(
    supported: &Allocation,
    defunds: &[&PendingRequest],
    funds: &[&PendingRequest],
) -> (Allocation, Vec<ChannelId>) {
    let mut outcome = supported.clone();
    for defund in defunds {
        if let Ok(next) =
            outcome.retrieve_from_target(&defund.items, defund.request.channel_to_be_funded)
        {
            outcome = next;
        }
    }

    let mut not_funded = vec![];
    for fund in funds {
        match outcome.allocate_to_target(&fund.items, fund.request.channel_to_be_funded) {
            Ok(next) => outcome = next,
            Err(_) => not_funded.push(fund.request.channel_to_be_funded),
        }
    }
    (outcome, not_funded)
}

fn exchange_proposals(
    snapshot: &LedgerSnapshot<'_>,
    supported: &Allocation,
    config: &ConsensusConfig,
) -> LedgerAction {
    // Already proposed; wait for the counterparty's.
    if snapshot.my_proposal.is_some() {
        return LedgerAction::Nothing;
    }

    let defunds = ordered(snapshot.pending, RequestKind::Defund, config);
    let funds = ordered(snapshot.pending, RequestKind::Fund, config);
    let (outcome, not_funded) = build_candidate(supported, &defunds, &funds);

    if outcome == *supported {
        if not_funded.is_empty() {
            LedgerAction::Nothing
        } else {
            LedgerAction::MarkInsufficient(not_funded)
        }
    } else {
        let next_nonce = snapshot.their_proposal.map_or(0, |p| p.nonce) + 1;
        LedgerAction::Propose(LedgerProposal {
            ledger_channel_id: snapshot.ledger.channel_id(),
            outcome,
            nonce: next_nonce,
            proposer: snapshot.ledger.my_address(),
        })
    }
}

/// Total order over in-flight proposals, so two concurrent rounds resolve
/// without a leader: the higher (chain id, ledger id, nonce, proposer)
/// tuple wins and its asks are applied first when merging.
fn proposal_precedes(a: &LedgerProposal, b: &LedgerProposal, ledger: &Channel) -> bool {
    let key = |p: &LedgerProposal| {
        (
            ledger.constants.chain_id,
            p.ledger_channel_id,
            p.nonce,
            p.proposer,
        )
    };
    key(a) > key(b)
}

fn exchange_signed_states(
    snapshot: &LedgerSnapshot<'_>,
    supported: &Allocation,
    supported_turn: u32,
    mine: &LedgerProposal,
    theirs: &LedgerProposal,
    config: &ConsensusConfig,
) -> Result<LedgerAction, ProtocolError> {
    let next_turn = supported_turn + 1;

    // Already signed this round; nothing to do until the countersignature
    // or a dismissal arrives.
    if snapshot
        .ledger
        .latest_signed_by_me()
        .map_or(false, |ss| ss.state.turn_num() == next_turn)
    {
        return Ok(LedgerAction::Nothing);
    }

    let outcome = if mine.outcome == theirs.outcome {
        mine.outcome.clone()
    } else {
        merge_proposals(snapshot, supported, mine, theirs, config)
    };

    // If the counterparty already revealed a signed state for this round it
    // must match what the algorithm computes; anything else means their
    // wallet broke the protocol.
    if let Some(revealed) = snapshot.ledger.state_at(next_turn) {
        if revealed.state.vars.outcome.as_allocation() != Some(&outcome) {
            return Err(ProtocolError::ConflictingSupportedState(
                snapshot.ledger.channel_id(),
            ));
        }
    }

    if outcome == *supported {
        return Ok(LedgerAction::Dismiss);
    }

    Ok(LedgerAction::SignUpdate(State {
        constants: snapshot.ledger.constants.clone(),
        vars: StateVars {
            turn_num: next_turn,
            outcome: Outcome::Allocation(outcome),
            app_data: vec![],
            is_final: false,
        },
    }))
}

/// Merge two differing proposals: only asks present in both survive, applied
/// in the tie-break winner's favor first.
fn merge_proposals(
    snapshot: &LedgerSnapshot<'_>,
    supported: &Allocation,
    mine: &LedgerProposal,
    theirs: &LedgerProposal,
    config: &ConsensusConfig,
) -> Allocation {
    let included = |proposal: &LedgerProposal, target: ChannelId| {
        proposal.outcome.amount_for(target.into()).is_some()
    };

    let winner_is_mine = proposal_precedes(mine, theirs, snapshot.ledger);
    let winner = if winner_is_mine { mine } else { theirs };

    let both_funding: Vec<&PendingRequest> = {
        let mut reqs: Vec<&PendingRequest> = ordered(snapshot.pending, RequestKind::Fund, config)
            .into_iter()
            .filter(|p| {
                included(mine, p.request.channel_to_be_funded)
                    && included(theirs, p.request.channel_to_be_funded)
            })
            .collect();
        // Apply in the winner's item order; both sides compute the same
        // winner, so both build the identical merged outcome.
        reqs.sort_by_key(|p| {
            let dest = p.request.channel_to_be_funded.into();
            winner
                .outcome
                .items
                .iter()
                .position(|item| item.destination == dest)
        });
        reqs
    };

    let both_defunding: Vec<&PendingRequest> = ordered(snapshot.pending, RequestKind::Defund, config)
        .into_iter()
        .filter(|p| {
            !included(mine, p.request.channel_to_be_funded)
                && !included(theirs, p.request.channel_to_be_funded)
        })
        .collect();

    build_candidate(supported, &both_defunding, &both_funding).0
}
