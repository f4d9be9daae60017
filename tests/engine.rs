//! End-to-end scenarios: two engines wired back to back, with the test
//! driving the transport and the chain oracle.

use nitro_engine::chain::ChainEvent;
use nitro_engine::objective::WaitingOn;
use nitro_engine::outcome::Outcome;
use nitro_engine::{
    Address, AddressedMessage, ChainTransaction, ChannelId, Engine, EngineConfig,
    FundingStrategy, ObjectiveId, ObjectiveStatus, Output, Signer, U256,
};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::BTreeMap;

fn signer(seed: u64) -> Signer {
    Signer::new(&mut StdRng::seed_from_u64(seed))
}

/// Everything that reached the outside world while a message exchange
/// settled.
#[derive(Default)]
struct Settled {
    transactions: Vec<ChainTransaction>,
    completed: Vec<(ObjectiveId, Result<(), String>)>,
}

/// A set of engines plus a lossless in-memory transport.
struct Net {
    engines: BTreeMap<Address, Engine>,
}

impl Net {
    fn new(seeds: &[u64], config: EngineConfig) -> (Self, Vec<Address>) {
        // RUST_LOG=nitro_engine=debug shows the crank-by-crank trace.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let mut engines = BTreeMap::new();
        let mut addresses = vec![];
        for &seed in seeds {
            let signer = signer(seed);
            let address = signer.address();
            engines.insert(address, Engine::new(signer, config.clone()));
            addresses.push(address);
        }
        (Net { engines }, addresses)
    }

    fn engine(&self, address: Address) -> &Engine {
        &self.engines[&address]
    }

    /// Deliver every pending message until the engines go quiet.
    fn settle(&self, output: Output) -> Settled {
        let mut settled = Settled::default();
        settled.transactions.extend(output.transactions);
        settled.completed.extend(output.completed_objectives);

        let mut pending: Vec<AddressedMessage> = output.messages;
        let mut rounds = 0;
        while !pending.is_empty() {
            rounds += 1;
            assert!(rounds < 64, "message exchange did not settle");
            for addressed in std::mem::take(&mut pending) {
                let out = self
                    .engine(addressed.to)
                    .push_message(addressed.message)
                    .expect("delivery failed");
                pending.extend(out.messages);
                settled.transactions.extend(out.transactions);
                settled.completed.extend(out.completed_objectives);
            }
        }
        settled
    }

    /// Deliver one chain event to every engine tracking the channel and
    /// settle the fallout.
    fn chain_event(&self, event: ChainEvent) -> Settled {
        let mut combined = Output::default();
        for engine in self.engines.values() {
            if engine.get_channel_status(event.channel_id()).is_err() {
                continue;
            }
            combined.merge(engine.handle_chain_event(event.clone()).expect("chain event"));
        }
        self.settle(combined)
    }
}

fn deposited(channel_id: ChannelId, holdings_after: u64, block_number: u64) -> ChainEvent {
    ChainEvent::Deposited {
        channel_id,
        asset: Address::default(),
        amount: 0.into(),
        holdings_after: holdings_after.into(),
        block_number,
    }
}

fn succeeded(net: &Net, address: Address, channel: ChannelId, id: ObjectiveId) -> bool {
    net.engine(address)
        .get_channel_status(channel)
        .expect("status")
        .objectives
        .iter()
        .any(|(oid, status, _)| *oid == id && *status == ObjectiveStatus::Succeeded)
}

/// Open a directly funded ledger channel between `a` and `b` with 10/10.
fn open_ledger(net: &Net, a: Address, b: Address, nonce: u64) -> ChannelId {
    let (ledger, out) = net
        .engine(a)
        .create_ledger_channel(
            vec![a, b],
            nonce,
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 10.into()), (b.into(), 10.into())]),
        )
        .expect("create ledger");
    net.settle(out);
    let out = net.engine(b).join_channel(ledger).expect("join ledger");
    let settled = net.settle(out);
    // The first participant's deposit goes out as soon as the prefund is
    // supported.
    assert!(settled
        .transactions
        .iter()
        .any(|tx| matches!(tx, ChainTransaction::Deposit { .. })));

    let settled = net.chain_event(deposited(ledger, 10, nonce * 100 + 1));
    assert!(settled
        .transactions
        .iter()
        .any(|tx| matches!(tx, ChainTransaction::Deposit { .. })));
    net.chain_event(deposited(ledger, 20, nonce * 100 + 2));

    assert!(succeeded(net, a, ledger, ObjectiveId::open(ledger)));
    assert!(succeeded(net, b, ledger, ObjectiveId::open(ledger)));
    ledger
}

#[test]
fn direct_channel_opens_end_to_end() {
    let (net, addrs) = Net::new(&[1, 2], EngineConfig::default());
    let (a, b) = (addrs[0], addrs[1]);

    let (channel, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            7,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");
    net.settle(out);

    // Nothing moves on b's side before the objective is approved there.
    let status = net.engine(b).get_channel_status(channel).expect("status");
    assert_eq!(status.turn_num, None);
    assert!(status
        .objectives
        .iter()
        .any(|(_, s, w)| *s == ObjectiveStatus::Pending && *w == WaitingOn::Approval));

    let out = net.engine(b).join_channel(channel).expect("join");
    let settled = net.settle(out);

    // Prefund supported on both sides; a (participant 0) deposits first.
    match settled.transactions.as_slice() {
        [ChainTransaction::Deposit {
            amount,
            expected_held,
            ..
        }] => {
            assert_eq!(*amount, U256::from(5));
            assert_eq!(*expected_held, U256::zero());
        }
        other => panic!("expected exactly a's deposit, got {other:?}"),
    }

    // a's 5 landed; b follows with its own deposit.
    let settled = net.chain_event(deposited(channel, 5, 1));
    match settled.transactions.as_slice() {
        [ChainTransaction::Deposit { expected_held, .. }] => {
            assert_eq!(*expected_held, U256::from(5));
        }
        other => panic!("expected b's deposit, got {other:?}"),
    }

    // Fully funded: postfund exchange completes the objective everywhere.
    net.chain_event(deposited(channel, 10, 2));
    for addr in [a, b] {
        let status = net.engine(addr).get_channel_status(channel).expect("status");
        assert_eq!(status.turn_num, Some(1));
        assert!(status.fully_funded);
        assert!(succeeded(&net, addr, channel, ObjectiveId::open(channel)));
    }
}

#[test]
fn redelivered_messages_are_idempotent() {
    let (net, addrs) = Net::new(&[3, 4], EngineConfig::default());
    let (a, b) = (addrs[0], addrs[1]);

    let (channel, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            1,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");

    let copies: Vec<AddressedMessage> = out.messages.clone();
    net.settle(out);
    net.engine(b).join_channel(channel).map(|o| net.settle(o)).expect("join");

    // The transport redelivers everything from the start of the session.
    for addressed in copies {
        let out = net
            .engine(addressed.to)
            .push_message(addressed.message)
            .expect("redelivery must not error");
        net.settle(out);
    }

    // Still exactly one channel, one open objective, prefund supported once.
    let status = net.engine(b).get_channel_status(channel).expect("status");
    assert_eq!(status.turn_num, Some(0));
    assert_eq!(
        status
            .objectives
            .iter()
            .filter(|(id, _, _)| *id == ObjectiveId::open(channel))
            .count(),
        1
    );
}

#[test]
fn ledger_grants_what_fits_and_defers_the_rest() {
    let (net, addrs) = Net::new(&[5, 6], EngineConfig::default());
    let (a, b) = (addrs[0], addrs[1]);
    let ledger = open_ledger(&net, a, b, 1);

    // Two channels ask for 8 and 15 out of a 20 ledger.
    let (small, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            2,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 4.into()), (b.into(), 4.into())]),
            FundingStrategy::Ledger(ledger),
        )
        .expect("create small");
    net.settle(out);
    let (big, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            3,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 8.into()), (b.into(), 7.into())]),
            FundingStrategy::Ledger(ledger),
        )
        .expect("create big");
    net.settle(out);
    net.engine(b).join_channel(small).map(|o| net.settle(o)).expect("join small");
    net.engine(b).join_channel(big).map(|o| net.settle(o)).expect("join big");

    // The 8 fits and funds; the 15 stays pending. The ledger never allocates
    // more than it holds.
    for addr in [a, b] {
        let status = net.engine(addr).get_channel_status(ledger).expect("status");
        let outcome = status.outcome.expect("supported outcome");
        let allocation = outcome.as_allocation().expect("allocation");
        assert_eq!(allocation.amount_for(small.into()), Some(U256::from(8)));
        assert_eq!(allocation.amount_for(big.into()), None);
        assert_eq!(allocation.total(), U256::from(20));

        assert!(succeeded(&net, addr, small, ObjectiveId::open(small)));
        let big_status = net.engine(addr).get_channel_status(big).expect("status");
        assert!(big_status.objectives.iter().any(|(id, status, waiting)| {
            *id == ObjectiveId::ledger_funding(big)
                && *status == ObjectiveStatus::Approved
                && *waiting == WaitingOn::LedgerRound
        }));
    }

    // Closing the funded channel returns its 8 to the ledger, which then
    // affords the deferred 15 in the same round.
    let out = net.engine(a).close_channel(small).expect("close");
    net.settle(out);

    for addr in [a, b] {
        let status = net.engine(addr).get_channel_status(ledger).expect("status");
        let outcome = status.outcome.expect("supported outcome");
        let allocation = outcome.as_allocation().expect("allocation");
        assert_eq!(allocation.amount_for(small.into()), None);
        assert_eq!(allocation.amount_for(big.into()), Some(U256::from(15)));
        assert_eq!(allocation.total(), U256::from(20));

        assert!(net.engine(addr).get_channel_status(small).expect("status").concluded);
        assert!(succeeded(&net, addr, small, ObjectiveId::close(small)));
        assert!(succeeded(&net, addr, big, ObjectiveId::open(big)));
    }
}

#[test]
fn virtual_channel_funds_through_an_intermediary() {
    use nitro_engine::ChannelConstants;

    let (net, addrs) = Net::new(&[11, 12, 13], EngineConfig::default());
    let (alice, irene, bob) = (addrs[0], addrs[1], addrs[2]);

    // One funded ledger per hop.
    let ledger_ai = open_ledger(&net, alice, irene, 1);
    let ledger_ib = open_ledger(&net, irene, bob, 2);

    let constants = |nonce: u64, participants: Vec<Address>| {
        ChannelConstants::new(1.into(), nonce, participants, Address::default(), 60)
            .expect("constants")
    };
    let joint_constants = constants(30, vec![alice, irene, bob]);
    let guarantor_constants = vec![
        constants(31, vec![alice, irene]),
        constants(32, vec![irene, bob]),
    ];
    let guarantor_ids: Vec<ChannelId> = guarantor_constants
        .iter()
        .map(|c| c.channel_id())
        .collect();

    let (joint, out) = net
        .engine(alice)
        .fund_virtually(
            joint_constants,
            Outcome::simple(
                Address::default(),
                vec![(alice.into(), 3.into()), (bob.into(), 3.into())],
            ),
            guarantor_constants,
            vec![ledger_ai, ledger_ib],
        )
        .expect("fund virtually");
    net.settle(out);

    net.engine(irene).join_channel(joint).map(|o| net.settle(o)).expect("irene joins");
    net.engine(bob).join_channel(joint).map(|o| net.settle(o)).expect("bob joins");

    // Both hops earmarked the joint total (6) behind their guarantor; the
    // joint postfund is supported, completing the objective for everyone.
    for (addr, hop) in [(alice, 0), (irene, 0), (irene, 1), (bob, 1)] {
        let ledger = [ledger_ai, ledger_ib][hop];
        let status = net.engine(addr).get_channel_status(ledger).expect("status");
        let outcome = status.outcome.expect("supported outcome");
        let allocation = outcome.as_allocation().expect("allocation");
        assert_eq!(
            allocation.amount_for(guarantor_ids[hop].into()),
            Some(U256::from(6))
        );
        assert_eq!(allocation.total(), U256::from(20));
    }
    for addr in [alice, irene, bob] {
        let status = net.engine(addr).get_channel_status(joint).expect("status");
        assert_eq!(status.turn_num, Some(1));
        assert!(succeeded(&net, addr, joint, ObjectiveId::virtual_funding(joint)));
    }
}

#[test]
fn snapshot_restore_re_emits_unacknowledged_messages() {
    let config = EngineConfig::default();
    let engine = Engine::new(signer(7), config.clone());
    let a = engine.address().expect("address");
    let b = signer(8).address();

    let (channel, out) = engine
        .create_channel(
            vec![a, b],
            9,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");
    let sent = out.messages.len();
    assert!(sent > 0);

    // Crash before anything was acknowledged.
    let bytes = bincode::serialize(&engine.snapshot()).expect("serialize");
    drop(engine);
    let snapshot = bincode::deserialize(&bytes).expect("deserialize");
    let restored = Engine::restore(snapshot, signer(7), config);

    let out = restored.resume().expect("resume");
    assert_eq!(out.messages.len(), sent);
    // Resuming twice re-emits again; nothing was lost or acknowledged.
    let out = restored.resume().expect("resume again");
    assert_eq!(out.messages.len(), sent);

    let status = restored.get_channel_status(channel).expect("status");
    assert_eq!(status.channel_id, channel);
    assert!(!status.objectives.is_empty());
}

#[derive(Debug, Default)]
struct RecordingChain {
    submitted: std::sync::Mutex<Vec<ChainTransaction>>,
}

impl nitro_engine::ChainService for RecordingChain {
    fn submit_transaction(
        &self,
        tx: &ChainTransaction,
    ) -> Result<nitro_engine::Hash, nitro_engine::chain::ChainServiceError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(tx.clone());
        Ok(nitro_engine::Hash([submitted.len() as u8; 32]))
    }
}

#[test]
fn transactions_dispatch_once_through_the_chain_service() {
    let (net, addrs) = Net::new(&[14, 15], EngineConfig::default());
    let (a, b) = (addrs[0], addrs[1]);

    let (channel, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            1,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");
    net.settle(out);
    net.engine(b).join_channel(channel).map(|o| net.settle(o)).expect("join");

    // a's deposit is queued; dispatching hands it to the chain client and
    // acknowledges it, so a second dispatch submits nothing.
    let chain = RecordingChain::default();
    let hashes = net.engine(a).dispatch_transactions(&chain).expect("dispatch");
    assert_eq!(hashes.len(), 1);
    assert!(matches!(
        chain.submitted.lock().unwrap()[0],
        ChainTransaction::Deposit { .. }
    ));
    assert!(net
        .engine(a)
        .dispatch_transactions(&chain)
        .expect("re-dispatch")
        .is_empty());
}

#[test]
fn cancel_is_rejected_once_the_deposit_went_out() {
    use nitro_engine::error::ProtocolError;
    use nitro_engine::EngineError;

    let (net, addrs) = Net::new(&[16, 17], EngineConfig::default());
    let (a, b) = (addrs[0], addrs[1]);

    let (channel, out) = net
        .engine(a)
        .create_channel(
            vec![a, b],
            1,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");
    net.settle(out);
    net.engine(b).join_channel(channel).map(|o| net.settle(o)).expect("join");

    // a's deposit is already on its way to the chain; neither the funding
    // objective nor its supervisor can be abandoned anymore.
    for id in [
        ObjectiveId::direct_funding(channel),
        ObjectiveId::open(channel),
    ] {
        let err = net.engine(a).cancel_objective(&id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol(ProtocolError::IrreversibleObjective(_))
        ));
    }

    // b deposits second and has not touched the chain yet, so b may still
    // walk away.
    let out = net
        .engine(b)
        .cancel_objective(&ObjectiveId::open(channel))
        .expect("cancel");
    assert!(out
        .completed_objectives
        .iter()
        .any(|(id, result)| *id == ObjectiveId::open(channel) && result.is_err()));
}

#[test]
fn unresponsive_peer_times_out_after_re_nudging() {
    let config = EngineConfig {
        counterparty_timeout: Some(10),
        ..EngineConfig::default()
    };
    let engine = Engine::new(signer(9), config);
    let a = engine.address().expect("address");
    let b = signer(10).address();

    let (channel, _) = engine
        .create_channel(
            vec![a, b],
            1,
            Address::default(),
            60,
            Outcome::simple(Address::default(), vec![(a.into(), 5.into()), (b.into(), 5.into())]),
            FundingStrategy::Direct,
        )
        .expect("create channel");

    // Before the deadline nothing happens.
    assert!(engine.tick(5).expect("tick").completed_objectives.is_empty());

    // Each expired deadline re-sends our latest signature, three times.
    for now in [10, 20, 30] {
        let out = engine.tick(now).expect("tick");
        assert!(out.completed_objectives.is_empty());
        assert!(out
            .messages
            .iter()
            .any(|m| m.to == b && !m.message.signed_states.is_empty()));
    }

    // The fourth expiry gives up: the funding objective and its supervisor
    // both fail.
    let out = engine.tick(40).expect("tick");
    let failed: Vec<_> = out
        .completed_objectives
        .iter()
        .filter(|(_, result)| result.is_err())
        .map(|(id, _)| id.clone())
        .collect();
    assert!(failed.contains(&ObjectiveId::direct_funding(channel)));
    assert!(failed.contains(&ObjectiveId::open(channel)));
}
