//! Direct funding: prefund, on-chain deposits in participant order, postfund.

use super::{advance_turn, CrankContext, CrankOutput, Effect, TurnProgress, WaitingOn};
use crate::chain::ChainTransaction;
use crate::channel::SignedState;
use crate::types::{ChannelId, Destination, U256};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirectFunding {
    pub target: ChannelId,
    /// Our deposit transaction went out; never submit it twice.
    pub deposit_submitted: bool,
}

impl DirectFunding {
    pub fn new(target: ChannelId) -> Self {
        DirectFunding {
            target,
            deposit_submitted: false,
        }
    }

    pub fn crank(&mut self, ctx: &CrankContext<'_>) -> CrankOutput {
        let channel = ctx.channel;

        // Prefund: turn 0 must be supported before anyone touches the chain.
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

        // Deposits, in allocation-item order. Each participant waits until
        // everyone ahead has deposited, so a defecting peer can only lose
        // their own funds.
        let allocation = match prefund.state.vars.outcome.as_allocation() {
            Some(a) => a,
            None => return CrankOutput::failed("direct funding needs an allocation outcome"),
        };
        let need = allocation.total();
        let held = channel.total_funding();

        if held < need {
            if !self.deposit_submitted {
                if let Some((expected_held, amount)) = my_deposit(&prefund, channel.my_address().into())
                {
                    if held >= expected_held && !amount.is_zero() {
                        self.deposit_submitted = true;
                        return CrankOutput::waiting_with(
                            WaitingOn::FundsDeposited,
                            vec![Effect::SubmitTransaction(ChainTransaction::Deposit {
                                channel_id: self.target,
                                asset: allocation.asset,
                                amount,
                                expected_held,
                            })],
                        );
                    }
                }
            }
            return CrankOutput::waiting(WaitingOn::FundsDeposited);
        }

        // Postfund: signing turn 1 certifies we saw the channel funded.
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

/// Our deposit slot: (holdings that must already be on chain, our amount).
/// None when the prefund outcome owes us nothing.
fn my_deposit(prefund: &SignedState, me: Destination) -> Option<(U256, U256)> {
    let allocation = prefund.state.vars.outcome.as_allocation()?;
    let mut ahead = U256::zero();
    for item in &allocation.items {
        if item.destination == me {
            return Some((ahead, item.amount));
        }
        ahead = ahead + item.amount;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelConstants, ChannelRole, State, StateVars};
    use crate::outcome::Outcome;
    use crate::sig::Signer;
    use crate::types::Address;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::BTreeMap;

    struct Setup {
        alice: Signer,
        bob: Signer,
        channel: Channel,
        prefund: State,
    }

    fn setup(my_index: usize) -> Setup {
        let mut rng = StdRng::seed_from_u64(3);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        let constants = ChannelConstants::new(
            1.into(),
            7,
            vec![alice.address(), bob.address()],
            Address::default(),
            60,
        )
        .unwrap();
        let prefund = State {
            constants: constants.clone(),
            vars: StateVars {
                turn_num: 0,
                outcome: Outcome::simple(
                    Address::default(),
                    vec![
                        (alice.address().into(), 5.into()),
                        (bob.address().into(), 5.into()),
                    ],
                ),
                app_data: vec![],
                is_final: false,
            },
        };
        let channel = Channel::new(constants, my_index, ChannelRole::Application);
        Setup {
            alice,
            bob,
            channel,
            prefund,
        }
    }

    fn support(setup: &mut Setup, state: &State) {
        let mut ss = SignedState::new(state.clone());
        ss.add_signature(setup.alice.sign_eth(state.state_hash()))
            .unwrap();
        ss.add_signature(setup.bob.sign_eth(state.state_hash()))
            .unwrap();
        setup.channel.add_signed_state(ss).unwrap();
    }

    fn ctx<'a>(channel: &'a Channel, related: &'a BTreeMap<ChannelId, Channel>) -> CrankContext<'a> {
        CrankContext {
            channel,
            related,
            requests: &[],
            child_status: None,
        }
    }

    #[test]
    fn signs_prefund_when_peer_sent_it() {
        let mut s = setup(1);
        let mut ss = SignedState::new(s.prefund.clone());
        ss.add_signature(s.alice.sign_eth(s.prefund.state_hash()))
            .unwrap();
        s.channel.add_signed_state(ss).unwrap();

        let related = BTreeMap::new();
        let mut data = DirectFunding::new(s.channel.channel_id());
        let out = data.crank(&ctx(&s.channel, &related));
        assert_eq!(out.effects, vec![Effect::SignState(s.prefund.clone())]);
        assert!(out.done.is_none());
    }

    #[test]
    fn first_participant_deposits_first() {
        let mut s = setup(0);
        let prefund = s.prefund.clone();
        support(&mut s, &prefund);

        let related = BTreeMap::new();
        let mut data = DirectFunding::new(s.channel.channel_id());
        let out = data.crank(&ctx(&s.channel, &related));
        match &out.effects[..] {
            [Effect::SubmitTransaction(ChainTransaction::Deposit {
                amount,
                expected_held,
                ..
            })] => {
                assert_eq!(*amount, 5.into());
                assert_eq!(*expected_held, U256::zero());
            }
            other => panic!("expected a deposit, got {other:?}"),
        }
        assert!(data.deposit_submitted);

        // Re-cranking never submits a second deposit.
        let out = data.crank(&ctx(&s.channel, &related));
        assert!(out.effects.is_empty());
        assert_eq!(out.waiting_on, WaitingOn::FundsDeposited);
    }

    #[test]
    fn second_participant_waits_for_the_first_deposit() {
        let mut s = setup(1);
        let prefund = s.prefund.clone();
        support(&mut s, &prefund);

        let related = BTreeMap::new();
        let mut data = DirectFunding::new(s.channel.channel_id());
        let out = data.crank(&ctx(&s.channel, &related));
        assert!(out.effects.is_empty());
        assert_eq!(out.waiting_on, WaitingOn::FundsDeposited);

        // Alice's 5 landed; now it is our turn.
        s.channel.funding.insert(Address::default(), 5.into());
        let out = data.crank(&ctx(&s.channel, &related));
        match &out.effects[..] {
            [Effect::SubmitTransaction(ChainTransaction::Deposit {
                amount,
                expected_held,
                ..
            })] => {
                assert_eq!(*amount, 5.into());
                assert_eq!(*expected_held, 5.into());
            }
            other => panic!("expected a deposit, got {other:?}"),
        }
    }

    #[test]
    fn completes_on_supported_postfund() {
        let mut s = setup(0);
        let prefund = s.prefund.clone();
        support(&mut s, &prefund);
        s.channel.funding.insert(Address::default(), 10.into());

        let related = BTreeMap::new();
        let mut data = DirectFunding::new(s.channel.channel_id());

        // Fully funded: the machine offers the postfund for signing.
        let out = data.crank(&ctx(&s.channel, &related));
        assert_eq!(out.effects, vec![Effect::SignState(prefund.make_next())]);

        let postfund = prefund.make_next();
        support(&mut s, &postfund);
        let out = data.crank(&ctx(&s.channel, &related));
        assert_eq!(out.done, Some(Ok(())));
    }
}
