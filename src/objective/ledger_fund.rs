//! Ledger funding: back a channel by an allocation item in a shared ledger
//! instead of fresh on-chain deposits.

use super::{advance_turn, CrankContext, CrankOutput, Effect, TurnProgress, WaitingOn};
use crate::channel::Channel;
use crate::consensus::{RequestKind, RequestStatus};
use crate::types::{ChannelId, U256};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerFunding {
    pub target: ChannelId,
    pub ledger: ChannelId,
    /// The fund request was enqueued; enqueueing is not idempotent.
    pub requested: bool,
}

impl LedgerFunding {
    pub fn new(target: ChannelId, ledger: ChannelId) -> Self {
        LedgerFunding {
            target,
            ledger,
            requested: false,
        }
    }

    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let channel = ctx.channel;

        let prefund = match advance_turn(channel, 0, None) {
            TurnProgress::NeedState | TurnProgress::Waiting => {
                return CrankOutput::waiting(WaitingOn::PeerSignature {
                    channel: self.target,
                    turn: 0,
                });
            }
            TurnProgress::SignIt(state) => {
                return CrankOutput::waiting_with(
                    WaitingOn::PeerSignature {
                        channel: self.target,
                        turn: 0,
                    },
                    vec![Effect::SignState(state)],
                );
            }
            TurnProgress::Supported => channel
                .state_at(0)
                .expect("supported turn 0 exists")
                .clone(),
        };

        let need = prefund.state.vars.outcome.total();
        let ledger = match ctx.related.get(&self.ledger) {
            Some(ledger) => ledger,
            None => return CrankOutput::failed("funding ledger is not known to this engine"),
        };

        if ledger_pays(ledger, self.target) < need {
            if let Some(request) = ctx.requests.iter().find(|r| {
                r.ledger_channel_id == self.ledger
                    && r.channel_to_be_funded == self.target
                    && r.kind == RequestKind::Fund
            }) {
                if request.status == RequestStatus::Failed {
                    return CrankOutput::failed("ledger fund request failed");
                }
            }
            let effects = if self.requested {
                vec![]
            } else {
                self.requested = true;
                vec![Effect::EnqueueLedgerRequest {
                    ledger: self.ledger,
                    target: self.target,
                    kind: RequestKind::Fund,
                }]
            };
            return CrankOutput::waiting_with(WaitingOn::LedgerRound, effects);
        }

        match advance_turn(channel, 1, Some(prefund.state.make_next())) {
            TurnProgress::SignIt(state) => CrankOutput::waiting_with(
                WaitingOn::PeerSignature {
                    channel: self.target,
                    turn: 1,
                },
                vec![Effect::SignState(state)],
            ),
            TurnProgress::NeedState | TurnProgress::Waiting => {
                CrankOutput::waiting(WaitingOn::PeerSignature {
                    channel: self.target,
                    turn: 1,
                })
            }
            TurnProgress::Supported => CrankOutput::succeeded(),
        }
    }
}

/// How much the ledger's supported outcome currently puts behind `target`.
pub(crate) fn ledger_pays(ledger: &Channel, target: ChannelId) -> U256 {
    ledger
        .supported()
        .and_then(|ss| ss.state.vars.outcome.as_allocation().cloned())
        .and_then(|allocation| allocation.amount_for(target.into()))
        .unwrap_or_default()
}
