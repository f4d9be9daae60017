//! Closing: agree a final state, then unwind the funding.
//!
//! Defunding reverses however the channel was funded. Direct channels
//! conclude and withdraw on chain, ledger-funded channels reclaim their
//! ledger allocation, virtual channels release their guarantors, and a
//! guarantor is never released while the joint channel it backs is still
//! unconcluded.

use super::{
    CrankContext, CrankOutput, Effect, ObjectiveId, ObjectiveStatus, SpawnRequest, WaitingOn,
};
use crate::chain::ChainTransaction;
use crate::channel::{AdjudicatorStatus, FundingSource};
use crate::consensus::{RequestKind, RequestStatus};
use super::ledger_fund::ledger_pays;
use crate::types::{ChannelId, U256};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloseChannel {
    pub target: ChannelId,
    pub child: Option<ObjectiveId>,
}

impl CloseChannel {
    pub fn new(target: ChannelId) -> Self {
        CloseChannel {
            target,
            child: None,
        }
    }

    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let channel = ctx.channel;

        if !channel.concluded() {
            // Countersign a final state the peer already circulated, or
            // derive one from the supported state.
            if let Some(latest) = channel.latest() {
                if latest.state.vars.is_final {
                    let turn = latest.state.turn_num();
                    if latest.signed_by(channel.my_index) {
                        return CrankOutput::waiting(WaitingOn::PeerSignature {
                            channel: self.target,
                            turn,
                        });
                    }
                    return CrankOutput::waiting_with(
                        WaitingOn::PeerSignature {
                            channel: self.target,
                            turn,
                        },
                        vec![Effect::SignState(latest.state.clone())],
                    );
                }
            }
            let supported = match channel.supported() {
                Some(ss) => ss,
                None => {
                    return CrankOutput::failed("cannot close a channel with no supported state")
                }
            };
            let mut final_state = supported.state.make_next();
            final_state.vars.is_final = true;
            let turn = final_state.turn_num();
            return CrankOutput::waiting_with(
                WaitingOn::PeerSignature {
                    channel: self.target,
                    turn,
                },
                vec![Effect::SignState(final_state)],
            );
        }

        // Concluded: hand over to the defunding child.
        let child = match &self.child {
            Some(child) => child.clone(),
            None => {
                let child = ObjectiveId::defund(self.target);
                self.child = Some(child.clone());
                return CrankOutput::waiting_with(
                    WaitingOn::ChildObjective(child),
                    vec![Effect::SpawnObjective(SpawnRequest::Defund {
                        target: self.target,
                    })],
                );
            }
        };
        match ctx.child_status {
            Some(ObjectiveStatus::Succeeded) => CrankOutput::succeeded(),
            Some(ObjectiveStatus::Failed(reason)) => CrankOutput::failed(reason.clone()),
            _ => CrankOutput::waiting(WaitingOn::ChildObjective(child)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DefundChannel {
    pub target: ChannelId,
    pub requested: bool,
    pub tx_submitted: bool,
}

impl DefundChannel {
    pub fn new(target: ChannelId) -> Self {
        DefundChannel {
            target,
            requested: false,
            tx_submitted: false,
        }
    }

    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let channel = ctx.channel;
        let finalized = channel.adjudicator_status == AdjudicatorStatus::Finalized;

        match channel.funded_by.clone() {
            FundingSource::Direct => {
                if finalized {
                    // Finalized without our conclude tx (challenge timeout):
                    // reclaim with a plain withdrawal.
                    let mut out = CrankOutput::succeeded();
                    if !self.tx_submitted {
                        self.tx_submitted = true;
                        out.effects = vec![Effect::SubmitTransaction(ChainTransaction::Withdraw {
                            channel_id: self.target,
                        })];
                    }
                    return out;
                }
                let proof = match channel.supported() {
                    Some(ss) if ss.state.vars.is_final => ss.clone(),
                    // Not concluded yet; the close objective is still
                    // collecting final signatures.
                    _ => return CrankOutput::waiting(WaitingOn::Nothing),
                };
                let effects = if self.tx_submitted {
                    vec![]
                } else {
                    self.tx_submitted = true;
                    vec![Effect::SubmitTransaction(
                        ChainTransaction::ConcludeAndWithdraw {
                            channel_id: self.target,
                            finalization_proof: proof,
                        },
                    )]
                };
                CrankOutput::waiting_with(WaitingOn::ChainConfirmation, effects)
            }

            FundingSource::Ledger(ledger_id) => {
                if !channel.concluded() && !finalized {
                    return CrankOutput::waiting(WaitingOn::Nothing);
                }
                let ledger = match ctx.related.get(&ledger_id) {
                    Some(ledger) => ledger,
                    None => {
                        return CrankOutput::failed("funding ledger is not known to this engine")
                    }
                };
                if ledger_pays(ledger, self.target) == U256::zero() {
                    return CrankOutput::succeeded();
                }
                if ctx.requests.iter().any(|r| {
                    r.ledger_channel_id == ledger_id
                        && r.channel_to_be_funded == self.target
                        && r.kind == RequestKind::Defund
                        && r.status == RequestStatus::Failed
                }) {
                    return CrankOutput::failed("ledger defund request failed");
                }
                let effects = if self.requested {
                    vec![]
                } else {
                    self.requested = true;
                    vec![Effect::EnqueueLedgerRequest {
                        ledger: ledger_id,
                        target: self.target,
                        kind: RequestKind::Defund,
                    }]
                };
                CrankOutput::waiting_with(WaitingOn::LedgerRound, effects)
            }

            FundingSource::Virtual {
                guarantors,
                ledgers,
            } => {
                // Releasing a guarantee before the joint channel concluded
                // would let funds escape while the channel can still move.
                if !channel.concluded() && !finalized {
                    return CrankOutput::waiting(WaitingOn::Nothing);
                }

                let me = channel.my_address();
                let my_legs: Vec<(ChannelId, ChannelId)> = guarantors
                    .iter()
                    .zip(&ledgers)
                    .filter(|(g, _)| {
                        ctx.related
                            .get(g)
                            .map_or(false, |ch| ch.constants.index_of(me).is_some())
                    })
                    .map(|(g, l)| (*g, *l))
                    .collect();

                let mut all_released = true;
                for (guarantor, ledger_id) in &my_legs {
                    let ledger = match ctx.related.get(ledger_id) {
                        Some(ledger) => ledger,
                        None => {
                            return CrankOutput::failed(
                                "leg ledger is not known to this engine",
                            )
                        }
                    };
                    if ledger_pays(ledger, *guarantor) != U256::zero() {
                        all_released = false;
                    }
                }
                if all_released {
                    return CrankOutput::succeeded();
                }

                let effects = if self.requested {
                    vec![]
                } else {
                    self.requested = true;
                    my_legs
                        .iter()
                        .map(|(guarantor, ledger)| Effect::EnqueueLedgerRequest {
                            ledger: *ledger,
                            target: *guarantor,
                            kind: RequestKind::Defund,
                        })
                        .collect()
                };
                CrankOutput::waiting_with(WaitingOn::LedgerRound, effects)
            }
        }
    }
}
