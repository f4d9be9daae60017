//! The objective runtime: public API, crank loop and crash recovery.
//!
//! Every entry point follows the same shape: validate and ingest the input
//! under the affected channel's lease, then crank objectives and ledger
//! rounds until nothing moves anymore, recording every outbound message and
//! transaction in the store's outbox before it appears in the returned
//! [Output]. A crash after persist but before the caller ships the output
//! only causes re-emission on [Engine::resume], never loss.

use crate::chain::{
    apply_event, ChainEvent, ChainService, ChainServiceError, ChainTransaction, ChainWatcher,
};
use crate::channel::{
    AdjudicatorStatus, Channel, ChannelConstants, ChannelRole, FundingSource, SignedState, State,
    StateVars,
};
use crate::consensus::{
    self, ConsensusConfig, LedgerAction, LedgerRequest, LedgerSnapshot, PendingRequest,
    RequestKind, RequestStatus,
};
use crate::error::{EngineError, ProtocolError, ValidationError};
use crate::messages::{AddressedMessage, Message, ObjectiveProposal};
use crate::objective::{
    CloseChannel, CrankContext, DefundChannel, DirectFunding, Effect, FundingStrategy,
    LedgerFunding, Objective, ObjectiveData, ObjectiveId, ObjectiveStatus, OpenChannel,
    SpawnRequest, VirtualFunding, WaitingOn,
};
use crate::outcome::{AllocationItem, Guarantee, Outcome};
use crate::sig::{Signer, SigningService};
use crate::store::{Store, StoreSnapshot};
use crate::types::{Address, ChannelId, Hash, U256};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Policy knobs. None of these are protocol invariants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chain_id: U256,
    /// Peers with a different version are rejected outright.
    pub wallet_version: u32,
    /// Pending ledger requests passed over this many rounds jump the queue.
    pub starvation_threshold: u32,
    /// Peer-wait deadlines re-nudge this many times before hard failure.
    pub max_soft_retries: u32,
    /// Absolute-time budget per peer wait; `None` disables timeouts.
    pub counterparty_timeout: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chain_id: U256::from(1),
            wallet_version: 1,
            starvation_threshold: 3,
            max_soft_retries: 3,
            counterparty_timeout: None,
        }
    }
}

/// Everything one API call wants the boundary layer to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub messages: Vec<AddressedMessage>,
    pub transactions: Vec<ChainTransaction>,
    pub completed_objectives: Vec<(ObjectiveId, Result<(), String>)>,
}

impl Output {
    /// Fold another batch of outbound work into this one.
    pub fn merge(&mut self, other: Output) {
        self.messages.extend(other.messages);
        self.transactions.extend(other.transactions);
        self.completed_objectives.extend(other.completed_objectives);
    }
}

/// Snapshot view of one channel, for integrators and diagnostics.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub role: ChannelRole,
    pub turn_num: Option<u32>,
    pub outcome: Option<Outcome>,
    pub total_funding: U256,
    pub fully_funded: bool,
    pub concluded: bool,
    pub adjudicator_status: AdjudicatorStatus,
    pub objectives: Vec<(ObjectiveId, ObjectiveStatus, WaitingOn)>,
}

const MAX_CRANK_ROUNDS: usize = 32;

#[derive(Debug)]
pub struct Engine {
    store: Store,
    signing: SigningService,
    watcher: ChainWatcher,
    config: EngineConfig,
    /// Last externally supplied time, fed to deadlines.
    clock: AtomicU64,
}

impl Engine {
    pub fn new(signer: Signer, config: EngineConfig) -> Self {
        Engine {
            store: Store::new(),
            signing: SigningService::new(signer),
            watcher: ChainWatcher::new(),
            config,
            clock: AtomicU64::new(0),
        }
    }

    /// Rebuild an engine from persisted state. Callers follow up with
    /// [Engine::resume] to re-emit unacknowledged outbound work.
    pub fn restore(snapshot: StoreSnapshot, signer: Signer, config: EngineConfig) -> Self {
        Engine {
            store: Store::from_snapshot(snapshot),
            signing: SigningService::new(signer),
            watcher: ChainWatcher::new(),
            config,
            clock: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn address(&self) -> Result<Address, EngineError> {
        Ok(self.signing.address()?)
    }

    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn message(&self) -> Message {
        Message::new(self.config.wallet_version)
    }

    fn send(&self, to: Address, message: Message, output: &mut Output) {
        if message.is_empty() {
            return;
        }
        let addressed = AddressedMessage { to, message };
        self.store.push_outbound(addressed.clone());
        output.messages.push(addressed);
    }

    fn send_to_peers(&self, channel: &Channel, message: Message, output: &mut Output) {
        let me = channel.my_address();
        for p in &channel.constants.participants {
            if *p != me {
                self.send(*p, message.clone(), output);
            }
        }
    }

    /// Sign a state, fold it into the channel and broadcast the merged
    /// signed state to the other participants.
    fn sign_and_record(&self, state: State, output: &mut Output) -> Result<(), EngineError> {
        let channel_id = state.channel_id();
        let turn = state.turn_num();
        let sig = self.signing.sign(state.state_hash())?;
        let mut ss = SignedState::new(state);
        ss.add_signature(sig)?;

        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;
        let mut channel = lease.lock().expect("channel lease poisoned");
        let supported = channel.add_signed_state(ss)?;
        let merged = channel
            .state_at(turn)
            .expect("state was just inserted")
            .clone();
        debug!(channel = ?channel_id, turn, supported, "state signed");
        if supported && channel.role == ChannelRole::Ledger {
            self.store.clear_proposals(channel_id);
        }

        let mut message = self.message();
        message.signed_states.push(merged);
        self.send_to_peers(&channel, message, output);
        Ok(())
    }

    /// Open a directly- or ledger-funded channel with the given initial
    /// outcome. Returns the channel id and the first batch of outbound work.
    pub fn create_channel(
        &self,
        participants: Vec<Address>,
        channel_nonce: u64,
        app_definition: Address,
        challenge_duration: u64,
        outcome: Outcome,
        strategy: FundingStrategy,
    ) -> Result<(ChannelId, Output), EngineError> {
        let constants = ChannelConstants::new(
            self.config.chain_id,
            channel_nonce,
            participants,
            app_definition,
            challenge_duration,
        )?;
        self.open_channel(constants, outcome, ChannelRole::Application, strategy)
    }

    /// Open a shared ledger channel. Ledgers are always funded directly;
    /// their purpose is to fund everything else.
    pub fn create_ledger_channel(
        &self,
        participants: Vec<Address>,
        channel_nonce: u64,
        challenge_duration: u64,
        outcome: Outcome,
    ) -> Result<(ChannelId, Output), EngineError> {
        let constants = ChannelConstants::new(
            self.config.chain_id,
            channel_nonce,
            participants,
            Address::default(),
            challenge_duration,
        )?;
        self.open_channel(constants, outcome, ChannelRole::Ledger, FundingStrategy::Direct)
    }

    fn open_channel(
        &self,
        constants: ChannelConstants,
        outcome: Outcome,
        role: ChannelRole,
        strategy: FundingStrategy,
    ) -> Result<(ChannelId, Output), EngineError> {
        let me = self.signing.address()?;
        let my_index = constants
            .index_of(me)
            .ok_or(ValidationError::InvalidParticipantSet)?;
        let channel_id = constants.channel_id();

        let mut channel = Channel::new(constants.clone(), my_index, role);
        channel.funded_by = match &strategy {
            FundingStrategy::Direct | FundingStrategy::Virtual => FundingSource::Direct,
            FundingStrategy::Ledger(ledger) => FundingSource::Ledger(*ledger),
        };
        let prefund = State {
            constants: constants.clone(),
            vars: StateVars {
                turn_num: 0,
                outcome,
                app_data: vec![],
                is_final: false,
            },
        };
        channel.add_signed_state(SignedState::new(prefund))?;
        let participants = constants.participants.clone();
        self.store.insert_channel(channel)?;

        self.store.insert_objective(Objective::new(
            ObjectiveId::open(channel_id),
            channel_id,
            participants.clone(),
            ObjectiveStatus::Approved,
            ObjectiveData::OpenChannel(OpenChannel {
                target: channel_id,
                strategy: strategy.clone(),
                child: None,
            }),
        ));
        info!(channel = ?channel_id, ?role, "channel open proposed");

        let mut output = Output::default();
        let mut message = self.message();
        message.objectives.push(ObjectiveProposal::OpenChannel {
            constants,
            strategy,
            role,
        });
        for p in &participants {
            if *p != me {
                self.send(*p, message.clone(), &mut output);
            }
        }
        output.merge(self.crank_all()?);
        Ok((channel_id, output))
    }

    /// Propose funding a joint channel across N hops: one guarantor channel
    /// per hop, each backed by the ledger at the same position.
    pub fn fund_virtually(
        &self,
        joint_constants: ChannelConstants,
        outcome: Outcome,
        guarantor_constants: Vec<ChannelConstants>,
        ledgers: Vec<ChannelId>,
    ) -> Result<(ChannelId, Output), EngineError> {
        let me = self.signing.address()?;
        let joint_id = joint_constants.channel_id();
        let asset = outcome
            .as_allocation()
            .map(|a| a.asset)
            .unwrap_or_default();

        let my_index = joint_constants
            .index_of(me)
            .ok_or(ValidationError::InvalidParticipantSet)?;
        let guarantor_ids: Vec<ChannelId> =
            guarantor_constants.iter().map(|c| c.channel_id()).collect();

        let mut joint = Channel::new(joint_constants.clone(), my_index, ChannelRole::Joint);
        joint.funded_by = FundingSource::Virtual {
            guarantors: guarantor_ids.clone(),
            ledgers: ledgers.clone(),
        };
        let prefund = State {
            constants: joint_constants.clone(),
            vars: StateVars {
                turn_num: 0,
                outcome,
                app_data: vec![],
                is_final: false,
            },
        };
        joint.add_signed_state(SignedState::new(prefund))?;
        self.store.insert_channel(joint)?;

        self.create_my_guarantors(me, joint_id, asset, &guarantor_constants, &ledgers)?;

        let participants = joint_constants.participants.clone();
        self.store.insert_objective(Objective::new(
            ObjectiveId::virtual_funding(joint_id),
            joint_id,
            participants.clone(),
            ObjectiveStatus::Approved,
            ObjectiveData::VirtualFunding(VirtualFunding::new(
                joint_id,
                guarantor_ids,
                ledgers.clone(),
            )),
        ));
        info!(channel = ?joint_id, hops = guarantor_constants.len(), "virtual funding proposed");

        let mut output = Output::default();
        let mut message = self.message();
        message.objectives.push(ObjectiveProposal::VirtualFunding {
            joint: joint_constants,
            guarantors: guarantor_constants,
            ledgers,
            asset,
        });
        for p in &participants {
            if *p != me {
                self.send(*p, message.clone(), &mut output);
            }
        }
        output.merge(self.crank_all()?);
        Ok((joint_id, output))
    }

    /// Create the guarantor channels of the legs this participant is in,
    /// with their deterministic setup states.
    fn create_my_guarantors(
        &self,
        me: Address,
        joint_id: ChannelId,
        asset: Address,
        guarantor_constants: &[ChannelConstants],
        ledgers: &[ChannelId],
    ) -> Result<(), EngineError> {
        for (constants, ledger) in guarantor_constants.iter().zip(ledgers) {
            let my_index = match constants.index_of(me) {
                Some(idx) => idx,
                None => continue,
            };
            let mut guarantor =
                Channel::new(constants.clone(), my_index, ChannelRole::Guarantor);
            guarantor.funded_by = FundingSource::Ledger(*ledger);
            let setup = State {
                constants: constants.clone(),
                vars: StateVars {
                    turn_num: 0,
                    outcome: Outcome::Guarantee(Guarantee {
                        asset,
                        target_channel: joint_id,
                        destinations: constants
                            .participants
                            .iter()
                            .map(|p| (*p).into())
                            .collect(),
                    }),
                    app_data: vec![],
                    is_final: false,
                },
            };
            guarantor.add_signed_state(SignedState::new(setup))?;
            self.store.insert_channel(guarantor)?;
        }
        Ok(())
    }

    /// Approve every pending objective touching the channel. Remote
    /// proposals stay inert until this runs.
    pub fn join_channel(&self, channel_id: ChannelId) -> Result<Output, EngineError> {
        let mut approved_any = false;
        for mut objective in self.store.objectives_for_channel(channel_id) {
            if objective.status == ObjectiveStatus::Pending {
                objective.status = ObjectiveStatus::Approved;
                info!(channel = ?channel_id, objective = %objective.id, "objective approved");
                self.store.put_objective(objective);
                approved_any = true;
            }
        }
        if !approved_any {
            return Err(EngineError::UnknownObjective(format!(
                "no pending objective for {channel_id:?}"
            )));
        }
        self.crank_all()
    }

    /// Approve one specific pending objective.
    pub fn approve_objective(&self, id: &ObjectiveId) -> Result<Output, EngineError> {
        let mut objective = self
            .store
            .objective(id)
            .ok_or_else(|| EngineError::UnknownObjective(id.to_string()))?;
        if objective.status == ObjectiveStatus::Pending {
            objective.status = ObjectiveStatus::Approved;
            info!(objective = %id, "objective approved");
            self.store.put_objective(objective);
        }
        self.crank_all()
    }

    /// Abandon an objective this party no longer wants. Honored only while
    /// neither the objective nor a child of it has put anything on chain;
    /// after that the only ways out are completion or a challenge.
    pub fn cancel_objective(&self, id: &ObjectiveId) -> Result<Output, EngineError> {
        let root = self
            .store
            .objective(id)
            .ok_or_else(|| EngineError::UnknownObjective(id.to_string()))?;
        if root.status.is_terminal() {
            return Ok(Output::default());
        }

        let mut chain = vec![];
        let mut next = Some(root);
        while let Some(objective) = next {
            let child = match &objective.data {
                ObjectiveData::OpenChannel(d) => d.child.clone(),
                ObjectiveData::CloseChannel(d) => d.child.clone(),
                _ => None,
            };
            chain.push(objective);
            next = child.and_then(|id| self.store.objective(&id));
        }
        for objective in &chain {
            let irreversible = match &objective.data {
                ObjectiveData::DirectFunding(d) => d.deposit_submitted,
                ObjectiveData::DefundChannel(d) => d.tx_submitted,
                _ => false,
            };
            if irreversible {
                return Err(
                    ProtocolError::IrreversibleObjective(objective.id.to_string()).into(),
                );
            }
        }

        let mut output = Output::default();
        for mut objective in chain {
            if objective.status.is_terminal() {
                continue;
            }
            let reason = "objective cancelled locally".to_string();
            warn!(objective = %objective.id, "objective cancelled");
            objective.status = ObjectiveStatus::Failed(reason.clone());
            objective.deadline = None;
            output
                .completed_objectives
                .push((objective.id.clone(), Err(reason)));
            self.store.put_objective(objective);
        }
        output.merge(self.crank_all()?);
        Ok(output)
    }

    /// Propose closing a channel co-operatively.
    pub fn close_channel(&self, channel_id: ChannelId) -> Result<Output, EngineError> {
        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;
        let (participants, channel_clone) = {
            let channel = lease.lock().expect("channel lease poisoned");
            (channel.constants.participants.clone(), channel.clone())
        };

        self.store.insert_objective(Objective::new(
            ObjectiveId::close(channel_id),
            channel_id,
            participants,
            ObjectiveStatus::Approved,
            ObjectiveData::CloseChannel(CloseChannel::new(channel_id)),
        ));
        info!(channel = ?channel_id, "channel close proposed");

        let mut output = Output::default();
        let mut message = self.message();
        message
            .objectives
            .push(ObjectiveProposal::CloseChannel { target: channel_id });
        self.send_to_peers(&channel_clone, message, &mut output);
        output.merge(self.crank_all()?);
        Ok(output)
    }

    /// Put the latest supported state on chain to force progress.
    pub fn challenge(&self, channel_id: ChannelId) -> Result<Output, EngineError> {
        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;
        let candidate = lease
            .lock()
            .expect("channel lease poisoned")
            .supported()
            .cloned()
            .ok_or(ProtocolError::NoSupportedState(channel_id))?;

        let tx = ChainTransaction::Challenge {
            channel_id,
            candidate,
        };
        self.store.push_transaction(tx.clone());
        warn!(channel = ?channel_id, "challenge submitted");
        Ok(Output {
            transactions: vec![tx],
            ..Output::default()
        })
    }

    /// Ingest one peer message, then crank everything it touched.
    pub fn push_message(&self, message: Message) -> Result<Output, EngineError> {
        if message.wallet_version != self.config.wallet_version {
            return Err(ValidationError::IncompatibleWalletVersion {
                ours: self.config.wallet_version,
                theirs: message.wallet_version,
            }
            .into());
        }

        for proposal in &message.objectives {
            self.ingest_proposal(proposal)?;
        }
        for ss in message.signed_states {
            self.ingest_signed_state(ss)?;
        }
        for proposal in message.ledger_proposals {
            if self.store.channel(proposal.ledger_channel_id).is_none() {
                return Err(ValidationError::UnknownChannel.into());
            }
            self.store.set_their_proposal(proposal);
        }

        self.crank_all()
    }

    fn ingest_signed_state(&self, ss: SignedState) -> Result<(), EngineError> {
        let channel_id = ss.state.channel_id();
        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;
        let mut channel = lease.lock().expect("channel lease poisoned");
        let turn = ss.state.turn_num();
        let supported = channel.add_signed_state(ss)?;
        debug!(channel = ?channel_id, turn, supported, "state ingested");
        if supported && channel.role == ChannelRole::Ledger {
            // The round settled; stale proposals must not linger into the
            // next one.
            self.store.clear_proposals(channel_id);
        }
        Ok(())
    }

    fn ingest_proposal(&self, proposal: &ObjectiveProposal) -> Result<(), EngineError> {
        let me = self.signing.address()?;
        debug!(channel = ?proposal.target_channel_id(), "objective proposal received");
        match proposal {
            ObjectiveProposal::OpenChannel {
                constants,
                strategy,
                role,
            } => {
                let my_index = match constants.index_of(me) {
                    Some(idx) => idx,
                    None => {
                        warn!(channel = ?constants.channel_id(), "open proposal not addressed to us");
                        return Ok(());
                    }
                };
                if !matches!(role, ChannelRole::Application | ChannelRole::Ledger) {
                    return Err(ValidationError::WrongChannelId.into());
                }
                let channel_id = constants.channel_id();
                let mut channel = Channel::new(constants.clone(), my_index, *role);
                channel.funded_by = match strategy {
                    FundingStrategy::Direct | FundingStrategy::Virtual => FundingSource::Direct,
                    FundingStrategy::Ledger(ledger) => FundingSource::Ledger(*ledger),
                };
                self.store.insert_channel(channel)?;
                self.store.insert_objective(Objective::new(
                    ObjectiveId::open(channel_id),
                    channel_id,
                    constants.participants.clone(),
                    ObjectiveStatus::Pending,
                    ObjectiveData::OpenChannel(OpenChannel {
                        target: channel_id,
                        strategy: strategy.clone(),
                        child: None,
                    }),
                ));
                info!(channel = ?channel_id, "open proposal received, awaiting approval");
            }

            ObjectiveProposal::CloseChannel { target } => {
                let lease = self
                    .store
                    .channel(*target)
                    .ok_or(ValidationError::UnknownChannel)?;
                let participants = lease
                    .lock()
                    .expect("channel lease poisoned")
                    .constants
                    .participants
                    .clone();
                // A co-operative close is always honored; it only costs
                // signatures on a state we already agreed to.
                self.store.insert_objective(Objective::new(
                    ObjectiveId::close(*target),
                    *target,
                    participants,
                    ObjectiveStatus::Approved,
                    ObjectiveData::CloseChannel(CloseChannel::new(*target)),
                ));
                info!(channel = ?target, "close proposal received");
            }

            ObjectiveProposal::VirtualFunding {
                joint,
                guarantors,
                ledgers,
                asset,
            } => {
                let my_index = match joint.index_of(me) {
                    Some(idx) => idx,
                    None => {
                        warn!(channel = ?joint.channel_id(), "virtual proposal not addressed to us");
                        return Ok(());
                    }
                };
                let joint_id = joint.channel_id();
                let guarantor_ids: Vec<ChannelId> =
                    guarantors.iter().map(|c| c.channel_id()).collect();

                let mut channel = Channel::new(joint.clone(), my_index, ChannelRole::Joint);
                channel.funded_by = FundingSource::Virtual {
                    guarantors: guarantor_ids.clone(),
                    ledgers: ledgers.clone(),
                };
                self.store.insert_channel(channel)?;
                self.create_my_guarantors(me, joint_id, *asset, guarantors, ledgers)?;

                self.store.insert_objective(Objective::new(
                    ObjectiveId::virtual_funding(joint_id),
                    joint_id,
                    joint.participants.clone(),
                    ObjectiveStatus::Pending,
                    ObjectiveData::VirtualFunding(VirtualFunding::new(
                        joint_id,
                        guarantor_ids,
                        ledgers.clone(),
                    )),
                ));
                info!(channel = ?joint_id, "virtual funding proposal received, awaiting approval");
            }
        }
        Ok(())
    }

    /// Fold one chain event into the affected channel and wake whatever was
    /// waiting on it. Replays are dropped.
    pub fn handle_chain_event(&self, event: ChainEvent) -> Result<Output, EngineError> {
        if !self.watcher.observe(&event) {
            return Ok(Output::default());
        }
        let channel_id = event.channel_id();
        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;

        let mut output = Output::default();
        let applied = {
            let mut channel = lease.lock().expect("channel lease poisoned");
            apply_event(&mut channel, &event)
        };
        if let Err(err) = applied {
            // Divergence is fatal to the objectives on this channel and is
            // never retried; the channel needs manual attention.
            error!(channel = ?channel_id, %err, "chain divergence");
            let reason = err.to_string();
            for mut objective in self.store.objectives_for_channel(channel_id) {
                if !objective.status.is_terminal() {
                    objective.status = ObjectiveStatus::Failed(reason.clone());
                    output
                        .completed_objectives
                        .push((objective.id.clone(), Err(reason.clone())));
                    self.store.put_objective(objective);
                }
            }
        }

        if matches!(event, ChainEvent::Concluded { .. }) {
            // A conclusion we observe but did not drive still needs the
            // funding unwound.
            let participants = lease
                .lock()
                .expect("channel lease poisoned")
                .constants
                .participants
                .clone();
            self.store.insert_objective(Objective::new(
                ObjectiveId::defund(channel_id),
                channel_id,
                participants,
                ObjectiveStatus::Approved,
                ObjectiveData::DefundChannel(DefundChannel::new(channel_id)),
            ));
        }

        output.merge(self.crank_all()?);
        Ok(output)
    }

    /// Re-emit everything not yet acknowledged, then crank. The first call
    /// after [Engine::restore].
    pub fn resume(&self) -> Result<Output, EngineError> {
        let mut output = Output::default();
        output.messages = self
            .store
            .unacked_messages()
            .into_iter()
            .map(|e| e.message)
            .collect();
        output.transactions = self
            .store
            .unacked_transactions()
            .into_iter()
            .map(|e| e.transaction)
            .collect();
        output.merge(self.crank_all()?);
        Ok(output)
    }

    /// Acknowledge one outbox entry as durably handed off.
    pub fn ack(&self, id: u64) {
        self.store.ack(id);
    }

    /// Advance the engine's clock. Peer waits past their deadline are
    /// re-nudged up to `max_soft_retries` times, then failed with a timeout.
    pub fn tick(&self, now: u64) -> Result<Output, EngineError> {
        self.clock.store(now, Ordering::Relaxed);
        let timeout = match self.config.counterparty_timeout {
            Some(t) => t,
            None => return self.crank_all(),
        };

        let mut output = Output::default();
        for id in self.store.objective_ids() {
            let Some(mut objective) = self.store.objective(&id) else {
                continue;
            };
            if objective.status.is_terminal() {
                continue;
            }
            let Some(deadline) = objective.deadline else {
                continue;
            };
            if now < deadline {
                continue;
            }

            if objective.retries < self.config.max_soft_retries {
                objective.retries += 1;
                objective.deadline = Some(now + timeout);
                debug!(objective = %objective.id, retry = objective.retries, "re-nudging peer");
                // Re-send our newest signature on the target channel.
                if let Some(lease) = self.store.channel(objective.target) {
                    let channel = lease.lock().expect("channel lease poisoned");
                    if let Some(ss) = channel.latest_signed_by_me() {
                        let mut message = self.message();
                        message.signed_states.push(ss.clone());
                        self.send_to_peers(&channel, message, &mut output);
                    }
                }
                self.store.put_objective(objective);
            } else {
                let reason = ProtocolError::CounterpartyTimeout {
                    waiting_on: format!("{:?}", objective.waiting_on),
                }
                .to_string();
                warn!(objective = %objective.id, %reason, "objective timed out");
                objective.status = ObjectiveStatus::Failed(reason.clone());
                objective.deadline = None;
                output
                    .completed_objectives
                    .push((objective.id.clone(), Err(reason)));
                self.store.put_objective(objective);
            }
        }

        output.merge(self.crank_all()?);
        Ok(output)
    }

    pub fn get_channel_status(&self, channel_id: ChannelId) -> Result<ChannelStatus, EngineError> {
        let lease = self
            .store
            .channel(channel_id)
            .ok_or(ValidationError::UnknownChannel)?;
        let channel = lease.lock().expect("channel lease poisoned");
        let supported = channel.supported();
        Ok(ChannelStatus {
            channel_id,
            role: channel.role,
            turn_num: supported.map(|ss| ss.state.turn_num()),
            outcome: supported.map(|ss| ss.state.vars.outcome.clone()),
            total_funding: channel.total_funding(),
            fully_funded: channel.fully_funded(),
            concluded: channel.concluded(),
            adjudicator_status: channel.adjudicator_status,
            objectives: self
                .store
                .objectives_for_channel(channel_id)
                .into_iter()
                .map(|o| (o.id, o.status, o.waiting_on))
                .collect(),
        })
    }

    /// Submit every unacknowledged transaction through the chain seam,
    /// acknowledging each as it goes out.
    pub fn dispatch_transactions(
        &self,
        service: &dyn ChainService,
    ) -> Result<Vec<Hash>, ChainServiceError> {
        let mut hashes = vec![];
        for entry in self.store.unacked_transactions() {
            hashes.push(service.submit_transaction(&entry.transaction)?);
            self.store.ack(entry.id);
        }
        Ok(hashes)
    }

    /// Crank ledgers and objectives until quiescent.
    fn crank_all(&self) -> Result<Output, EngineError> {
        let mut output = Output::default();
        let mut bumped: HashSet<ChannelId> = HashSet::new();

        for _ in 0..MAX_CRANK_ROUNDS {
            let mut progress = false;
            for ledger_id in self.store.ledgers_with_pending_requests() {
                progress |= self.crank_ledger(ledger_id, &mut bumped, &mut output)?;
            }
            for id in self.store.objective_ids() {
                progress |= self.crank_objective(&id, &mut output)?;
            }
            if !progress {
                break;
            }
        }
        Ok(output)
    }

    fn clone_channels(&self) -> BTreeMap<ChannelId, Channel> {
        self.store
            .channel_ids()
            .into_iter()
            .filter_map(|id| {
                self.store
                    .channel(id)
                    .map(|lease| (id, lease.lock().expect("channel lease poisoned").clone()))
            })
            .collect()
    }

    fn crank_ledger(
        &self,
        ledger_id: ChannelId,
        bumped: &mut HashSet<ChannelId>,
        output: &mut Output,
    ) -> Result<bool, EngineError> {
        let channels = self.clone_channels();
        let ledger = match channels.get(&ledger_id) {
            Some(ledger) => ledger,
            None => return Ok(false),
        };

        let pending: Vec<PendingRequest> = self
            .store
            .requests_for(ledger_id)
            .into_iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .filter_map(|request| {
                let items = request_items(&request, &channels)?;
                let target_nonce = channels
                    .get(&request.channel_to_be_funded)?
                    .constants
                    .channel_nonce;
                Some(PendingRequest {
                    request,
                    items,
                    target_nonce,
                })
            })
            .collect();
        if pending.is_empty() {
            return Ok(false);
        }

        let round = self.store.proposal_round(ledger_id);
        let snapshot = LedgerSnapshot {
            ledger,
            my_proposal: round.mine.as_ref(),
            their_proposal: round.theirs.as_ref(),
            pending: &pending,
        };
        let consensus_config = ConsensusConfig {
            starvation_threshold: self.config.starvation_threshold,
        };
        let action = consensus::crank(&snapshot, &consensus_config)?;

        match action {
            LedgerAction::Nothing => Ok(false),
            LedgerAction::Propose(proposal) => {
                debug!(channel = ?ledger_id, nonce = proposal.nonce, "ledger update proposed");
                self.store.set_my_proposal(proposal.clone());
                let mut message = self.message();
                message.ledger_proposals.push(proposal);
                self.send_to_peers(ledger, message, output);
                Ok(true)
            }
            LedgerAction::SignUpdate(state) => {
                self.sign_and_record(state, output)?;
                Ok(true)
            }
            LedgerAction::Dismiss => {
                debug!(channel = ?ledger_id, "ledger proposals dismissed");
                self.store.clear_proposals(ledger_id);
                Ok(true)
            }
            LedgerAction::MarkInsufficient(targets) => {
                if bumped.insert(ledger_id) {
                    for target in targets {
                        debug!(channel = ?ledger_id, ?target, "request passed over, insufficient funds");
                        self.store.bump_missed_opportunity(ledger_id, target);
                    }
                }
                Ok(false)
            }
            LedgerAction::MarkComplete { funded, defunded } => {
                for target in funded {
                    debug!(channel = ?ledger_id, ?target, "fund request complete");
                    self.store.mark_request(
                        ledger_id,
                        target,
                        RequestKind::Fund,
                        RequestStatus::Succeeded,
                    );
                }
                for target in defunded {
                    debug!(channel = ?ledger_id, ?target, "defund request complete");
                    self.store.mark_request(
                        ledger_id,
                        target,
                        RequestKind::Defund,
                        RequestStatus::Succeeded,
                    );
                }
                Ok(true)
            }
        }
    }

    fn crank_objective(
        &self,
        id: &ObjectiveId,
        output: &mut Output,
    ) -> Result<bool, EngineError> {
        let Some(before) = self.store.objective(id) else {
            return Ok(false);
        };
        if before.status.is_terminal() {
            return Ok(false);
        }

        let channels = self.clone_channels();
        let target = match channels.get(&before.target) {
            Some(channel) => channel,
            None => return Ok(false),
        };
        let requests = self.store.all_requests();
        let child_id = match &before.data {
            ObjectiveData::OpenChannel(d) => d.child.clone(),
            ObjectiveData::CloseChannel(d) => d.child.clone(),
            _ => None,
        };
        let child_status = child_id
            .and_then(|child| self.store.objective(&child))
            .map(|o| o.status);

        let ctx = CrankContext {
            channel: target,
            related: &channels,
            requests: &requests,
            child_status: child_status.as_ref(),
        };

        let mut objective = before.clone();
        let effects = objective.crank(&ctx);

        if objective.waiting_on != before.waiting_on {
            objective.deadline = if is_peer_wait(&objective.waiting_on) {
                self.config.counterparty_timeout.map(|t| self.now() + t)
            } else {
                None
            };
        }

        // Persist the transition before any effect leaves the engine.
        self.store.put_objective(objective.clone());

        for effect in &effects {
            self.apply_effect(effect, output)?;
        }

        if objective.status.is_terminal() && !before.status.is_terminal() {
            match &objective.status {
                ObjectiveStatus::Succeeded => {
                    info!(objective = %objective.id, channel = ?objective.target, "objective succeeded");
                    output
                        .completed_objectives
                        .push((objective.id.clone(), Ok(())));
                }
                ObjectiveStatus::Failed(reason) => {
                    warn!(objective = %objective.id, channel = ?objective.target, %reason, "objective failed");
                    output
                        .completed_objectives
                        .push((objective.id.clone(), Err(reason.clone())));
                }
                _ => {}
            }
        }

        Ok(!effects.is_empty() || objective != before)
    }

    fn apply_effect(&self, effect: &Effect, output: &mut Output) -> Result<(), EngineError> {
        match effect {
            Effect::SignState(state) => self.sign_and_record(state.clone(), output),
            Effect::SubmitTransaction(tx) => {
                self.store.push_transaction(tx.clone());
                output.transactions.push(tx.clone());
                Ok(())
            }
            Effect::EnqueueLedgerRequest {
                ledger,
                target,
                kind,
            } => {
                self.store
                    .enqueue_request(LedgerRequest::new(*ledger, *target, *kind));
                Ok(())
            }
            Effect::SpawnObjective(request) => self.spawn_objective(request),
        }
    }

    fn spawn_objective(&self, request: &SpawnRequest) -> Result<(), EngineError> {
        let (id, target, data) = match request {
            SpawnRequest::DirectFunding { target } => (
                ObjectiveId::direct_funding(*target),
                *target,
                ObjectiveData::DirectFunding(DirectFunding::new(*target)),
            ),
            SpawnRequest::LedgerFunding { target, ledger } => (
                ObjectiveId::ledger_funding(*target),
                *target,
                ObjectiveData::LedgerFunding(LedgerFunding::new(*target, *ledger)),
            ),
            SpawnRequest::Defund { target } => (
                ObjectiveId::defund(*target),
                *target,
                ObjectiveData::DefundChannel(DefundChannel::new(*target)),
            ),
        };
        let participants = self
            .store
            .channel(target)
            .ok_or(ValidationError::UnknownChannel)?
            .lock()
            .expect("channel lease poisoned")
            .constants
            .participants
            .clone();
        debug!(objective = %id, channel = ?target, "child objective spawned");
        self.store
            .insert_objective(Objective::new(id, target, participants, ObjectiveStatus::Approved, data));
        Ok(())
    }
}

fn is_peer_wait(waiting_on: &WaitingOn) -> bool {
    matches!(
        waiting_on,
        WaitingOn::PeerSignature { .. } | WaitingOn::LedgerRound
    )
}

/// The per-destination contributions a ledger request moves. For regular
/// channels these come from the target's own allocation; a guarantor carries
/// the joint channel's amounts mapped onto the leg's two parties.
fn request_items(
    request: &LedgerRequest,
    channels: &BTreeMap<ChannelId, Channel>,
) -> Option<Vec<AllocationItem>> {
    let target = channels.get(&request.channel_to_be_funded)?;
    match target.role {
        ChannelRole::Guarantor => {
            let guarantee = target
                .state_at(0)?
                .state
                .vars
                .outcome
                .as_guarantee()?
                .clone();
            let joint = channels.get(&guarantee.target_channel)?;
            let allocation = match request.kind {
                RequestKind::Fund => joint.state_at(0)?.state.vars.outcome.as_allocation()?,
                RequestKind::Defund => joint.supported()?.state.vars.outcome.as_allocation()?,
            };
            Some(
                target
                    .constants
                    .participants
                    .iter()
                    .zip(&allocation.items)
                    .map(|(addr, item)| AllocationItem {
                        destination: (*addr).into(),
                        amount: item.amount,
                    })
                    .collect(),
            )
        }
        _ => {
            let allocation = match request.kind {
                RequestKind::Fund => target.state_at(0)?.state.vars.outcome.as_allocation()?,
                RequestKind::Defund => target.supported()?.state.vars.outcome.as_allocation()?,
            };
            Some(allocation.items.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn engine(seed: u64) -> (Engine, Address) {
        let mut rng = StdRng::seed_from_u64(seed);
        let signer = Signer::new(&mut rng);
        let addr = signer.address();
        (Engine::new(signer, EngineConfig::default()), addr)
    }

    #[test]
    fn wallet_version_mismatch_is_rejected() {
        let (engine, _) = engine(1);
        let err = engine.push_message(Message::new(99)).unwrap_err();
        assert_eq!(
            err,
            EngineError::Validation(ValidationError::IncompatibleWalletVersion {
                ours: 1,
                theirs: 99
            })
        );
    }

    #[test]
    fn create_channel_emits_proposal_and_signed_prefund() {
        let (engine, me) = engine(2);
        let mut rng = StdRng::seed_from_u64(3);
        let peer = Signer::new(&mut rng).address();

        let (channel_id, output) = engine
            .create_channel(
                vec![me, peer],
                7,
                Address::default(),
                60,
                Outcome::simple(
                    Address::default(),
                    vec![(me.into(), 5.into()), (peer.into(), 5.into())],
                ),
                FundingStrategy::Direct,
            )
            .unwrap();

        // One proposal message plus the signed prefund broadcast.
        assert!(output
            .messages
            .iter()
            .any(|m| !m.message.objectives.is_empty()));
        assert!(output
            .messages
            .iter()
            .any(|m| m.message.signed_states.iter().any(|ss| ss
                .state
                .channel_id()
                == channel_id)));
        assert!(output.messages.iter().all(|m| m.to == peer));

        let status = engine.get_channel_status(channel_id).unwrap();
        assert_eq!(status.role, ChannelRole::Application);
        // Nothing supported yet; the peer has not signed.
        assert_eq!(status.turn_num, None);
    }

    #[test]
    fn nonce_reuse_is_rejected() {
        let (engine, me) = engine(4);
        let mut rng = StdRng::seed_from_u64(5);
        let peer = Signer::new(&mut rng).address();
        let outcome =
            || Outcome::simple(Address::default(), vec![(me.into(), 1.into())]);

        engine
            .create_channel(
                vec![me, peer],
                7,
                Address::default(),
                60,
                outcome(),
                FundingStrategy::Direct,
            )
            .unwrap();
        let err = engine
            .create_channel(
                vec![me, peer],
                7,
                Address([1; 20]),
                60,
                outcome(),
                FundingStrategy::Direct,
            )
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Validation(ValidationError::DuplicateChannelNonce)
        );
    }

    #[test]
    fn cancel_abandons_an_unfunded_channel() {
        let (engine, me) = engine(8);
        let mut rng = StdRng::seed_from_u64(9);
        let peer = Signer::new(&mut rng).address();
        let (channel_id, _) = engine
            .create_channel(
                vec![me, peer],
                1,
                Address::default(),
                60,
                Outcome::simple(
                    Address::default(),
                    vec![(me.into(), 5.into()), (peer.into(), 5.into())],
                ),
                FundingStrategy::Direct,
            )
            .unwrap();

        // No deposit went out yet (the prefund is not supported), so the
        // supervisor and its funding child both unwind.
        let output = engine
            .cancel_objective(&ObjectiveId::open(channel_id))
            .unwrap();
        let failed: Vec<_> = output
            .completed_objectives
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(id, _)| id.clone())
            .collect();
        assert!(failed.contains(&ObjectiveId::open(channel_id)));
        assert!(failed.contains(&ObjectiveId::direct_funding(channel_id)));

        // Cancelling a settled objective changes nothing.
        let output = engine
            .cancel_objective(&ObjectiveId::open(channel_id))
            .unwrap();
        assert!(output.completed_objectives.is_empty());
    }

    #[test]
    fn challenge_needs_a_supported_state() {
        let (engine, me) = engine(6);
        let mut rng = StdRng::seed_from_u64(7);
        let peer = Signer::new(&mut rng).address();
        let (channel_id, _) = engine
            .create_channel(
                vec![me, peer],
                1,
                Address::default(),
                60,
                Outcome::simple(Address::default(), vec![(me.into(), 1.into())]),
                FundingStrategy::Direct,
            )
            .unwrap();

        let err = engine.challenge(channel_id).unwrap_err();
        assert_eq!(
            err,
            EngineError::Protocol(ProtocolError::NoSupportedState(channel_id))
        );
    }
}
