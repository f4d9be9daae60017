//! Virtual funding: fund a joint channel across N hops without touching the
//! chain, by earmarking funds in each hop's ledger through a guarantor
//! channel.
//!
//! Every participant runs the same machine over the joint channel; leaves
//! see one leg, intermediaries see two. The joint postfund signature is the
//! join barrier: nobody signs it before their own legs are funded, so a
//! supported postfund proves every leg is.

use super::{advance_turn, CrankContext, CrankOutput, Effect, TurnProgress, WaitingOn};
use super::ledger_fund::ledger_pays;
use crate::consensus::{RequestKind, RequestStatus};
use crate::types::ChannelId;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VirtualFunding {
    pub joint: ChannelId,
    /// One guarantor per hop, parallel to `ledgers`.
    pub guarantors: Vec<ChannelId>,
    pub ledgers: Vec<ChannelId>,
    pub requested: bool,
}

impl VirtualFunding {
    pub fn new(joint: ChannelId, guarantors: Vec<ChannelId>, ledgers: Vec<ChannelId>) -> Self {
        VirtualFunding {
            joint,
            guarantors,
            ledgers,
            requested: false,
        }
    }

    /// The legs this participant is a party of: at most two.
    fn my_legs<'a>(&'a self, ctx: &'a CrankContext<'_>) -> Vec<(ChannelId, ChannelId)> {
        let me = ctx.channel.my_address();
        self.guarantors
            .iter()
            .zip(&self.ledgers)
            .filter(|(g, _)| {
                ctx.related
                    .get(g)
                    .map_or(false, |ch| ch.constants.index_of(me).is_some())
            })
            .map(|(g, l)| (*g, *l))
            .collect()
    }

    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let joint = ctx.channel;

        // Joint prefund first: it fixes the amounts every leg must carry.
        let prefund = match advance_turn(joint, 0, None) {
            TurnProgress::NeedState | TurnProgress::Waiting => {
                return CrankOutput::waiting(WaitingOn::PeerSignature {
                    channel: self.joint,
                    turn: 0,
                });
            }
            TurnProgress::SignIt(state) => {
                return CrankOutput::waiting_with(
                    WaitingOn::PeerSignature {
                        channel: self.joint,
                        turn: 0,
                    },
                    vec![Effect::SignState(state)],
                );
            }
            TurnProgress::Supported => joint
                .state_at(0)
                .expect("supported turn 0 exists")
                .clone(),
        };

        let legs = self.my_legs(ctx);
        if legs.is_empty() {
            return CrankOutput::failed("no guarantor leg involves this participant");
        }

        // Guarantor setup states. All of ours are signed in one go; then we
        // wait for the first leg that is not yet supported.
        let mut effects = vec![];
        let mut setup_pending = None;
        for (guarantor, _) in &legs {
            let channel = ctx
                .related
                .get(guarantor)
                .expect("my_legs only yields known channels");
            match advance_turn(channel, 0, None) {
                TurnProgress::SignIt(state) => {
                    effects.push(Effect::SignState(state));
                    setup_pending.get_or_insert(*guarantor);
                }
                TurnProgress::NeedState | TurnProgress::Waiting => {
                    setup_pending.get_or_insert(*guarantor);
                }
                TurnProgress::Supported => {}
            }
        }
        if let Some(guarantor) = setup_pending {
            return CrankOutput::waiting_with(
                WaitingOn::PeerSignature {
                    channel: guarantor,
                    turn: 0,
                },
                effects,
            );
        }

        // Fund every leg through its ledger.
        let need = prefund.state.vars.outcome.total();
        let mut all_funded = true;
        for (guarantor, ledger_id) in &legs {
            let ledger = match ctx.related.get(ledger_id) {
                Some(ledger) => ledger,
                None => return CrankOutput::failed("leg ledger is not known to this engine"),
            };
            if ledger_pays(ledger, *guarantor) < need {
                all_funded = false;
            }
            if ctx.requests.iter().any(|r| {
                r.ledger_channel_id == *ledger_id
                    && r.channel_to_be_funded == *guarantor
                    && r.kind == RequestKind::Fund
                    && r.status == RequestStatus::Failed
            }) {
                return CrankOutput::failed("guarantor fund request failed");
            }
        }

        if !all_funded {
            let effects = if self.requested {
                vec![]
            } else {
                self.requested = true;
                legs.iter()
                    .map(|(guarantor, ledger)| Effect::EnqueueLedgerRequest {
                        ledger: *ledger,
                        target: *guarantor,
                        kind: RequestKind::Fund,
                    })
                    .collect()
            };
            return CrankOutput::waiting_with(WaitingOn::LedgerRound, effects);
        }

        // Join barrier: only sign the joint postfund once our legs carry the
        // funds; a supported postfund then proves everyone else's do too.
        match advance_turn(joint, 1, Some(prefund.state.make_next())) {
            TurnProgress::SignIt(state) => CrankOutput::waiting_with(
                WaitingOn::PeerSignature {
                    channel: self.joint,
                    turn: 1,
                },
                vec![Effect::SignState(state)],
            ),
            TurnProgress::NeedState | TurnProgress::Waiting => {
                CrankOutput::waiting(WaitingOn::PeerSignature {
                    channel: self.joint,
                    turn: 1,
                })
            }
            TurnProgress::Supported => CrankOutput::succeeded(),
        }
    }
}
