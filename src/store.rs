//! Persistence: channels, objectives, ledger rounds and the outbox.
//!
//! Channels hand out exclusive leases (`Arc<Mutex<Channel>>`), so transitions
//! on unrelated channels run in parallel while everything touching one
//! channel serializes. Outbound messages and transactions are recorded here
//! before they are handed to any transport; until acknowledged they are
//! re-emitted by `Engine::resume`, giving at-least-once delivery across
//! crashes. The whole store serializes to a [StoreSnapshot] for durability.

use crate::chain::ChainTransaction;
use crate::channel::Channel;
use crate::consensus::{LedgerProposal, LedgerRequest, RequestKind, RequestStatus};
use crate::error::ValidationError;
use crate::messages::AddressedMessage;
use crate::objective::{Objective, ObjectiveId};
use crate::types::{Address, ChannelId, Hash};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Both sides' proposals for the current ledger round.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProposalRound {
    pub mine: Option<LedgerProposal>,
    pub theirs: Option<LedgerProposal>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: u64,
    pub message: AddressedMessage,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TxEntry {
    pub id: u64,
    pub transaction: ChainTransaction,
}

#[derive(Debug, Default)]
struct Outbox {
    next_id: u64,
    messages: Vec<OutboxEntry>,
    transactions: Vec<TxEntry>,
}

/// Everything the engine persists, in serializable form.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreSnapshot {
    channels: Vec<Channel>,
    objectives: Vec<Objective>,
    requests: BTreeMap<ChannelId, Vec<LedgerRequest>>,
    proposals: BTreeMap<ChannelId, ProposalRound>,
    used_nonces: Vec<(Hash, u64)>,
    outbox_next_id: u64,
    outbox_messages: Vec<OutboxEntry>,
    outbox_transactions: Vec<TxEntry>,
}

#[derive(Debug, Default)]
pub struct Store {
    channels: RwLock<BTreeMap<ChannelId, Arc<Mutex<Channel>>>>,
    objectives: Mutex<BTreeMap<ObjectiveId, Objective>>,
    /// Pending and settled requests per ledger channel.
    requests: Mutex<BTreeMap<ChannelId, Vec<LedgerRequest>>>,
    proposals: Mutex<BTreeMap<ChannelId, ProposalRound>>,
    used_nonces: Mutex<HashSet<(Hash, u64)>>,
    outbox: Mutex<Outbox>,
}

/// Key for nonce-reuse detection: same participant set, same nonce.
fn nonce_key(participants: &[Address], nonce: u64) -> (Hash, u64) {
    let mut sorted: Vec<Address> = participants.to_vec();
    sorted.sort();
    let mut h = Keccak256::new();
    for p in sorted {
        h.update(p.0);
    }
    (Hash(h.finalize().into()), nonce)
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Register a channel. Rejects a nonce already used with the same
    /// participant set; re-inserting the identical channel id is a no-op so
    /// proposal re-delivery stays idempotent.
    pub fn insert_channel(&self, channel: Channel) -> Result<(), ValidationError> {
        let id = channel.channel_id();
        let mut channels = self.channels.write().expect("channel map poisoned");
        if channels.contains_key(&id) {
            return Ok(());
        }

        let key = nonce_key(&channel.constants.participants, channel.constants.channel_nonce);
        if !self
            .used_nonces
            .lock()
            .expect("nonce set poisoned")
            .insert(key)
        {
            return Err(ValidationError::DuplicateChannelNonce);
        }
        channels.insert(id, Arc::new(Mutex::new(channel)));
        Ok(())
    }

    /// The exclusive lease for one channel.
    pub fn channel(&self, id: ChannelId) -> Option<Arc<Mutex<Channel>>> {
        self.channels
            .read()
            .expect("channel map poisoned")
            .get(&id)
            .cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels
            .read()
            .expect("channel map poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn insert_objective(&self, objective: Objective) {
        let mut objectives = self.objectives.lock().expect("objective map poisoned");
        if objectives.contains_key(&objective.id) {
            // Same goal proposed twice merges into the existing instance.
            return;
        }
        objectives.insert(objective.id.clone(), objective);
    }

    pub fn objective(&self, id: &ObjectiveId) -> Option<Objective> {
        self.objectives
            .lock()
            .expect("objective map poisoned")
            .get(id)
            .cloned()
    }

    pub fn put_objective(&self, objective: Objective) {
        self.objectives
            .lock()
            .expect("objective map poisoned")
            .insert(objective.id.clone(), objective);
    }

    pub fn objective_ids(&self) -> Vec<ObjectiveId> {
        self.objectives
            .lock()
            .expect("objective map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn objectives_for_channel(&self, channel: ChannelId) -> Vec<Objective> {
        self.objectives
            .lock()
            .expect("objective map poisoned")
            .values()
            .filter(|o| o.target == channel)
            .cloned()
            .collect()
    }

    /// Enqueue a ledger request unless the same ask is already pending.
    pub fn enqueue_request(&self, request: LedgerRequest) {
        let mut requests = self.requests.lock().expect("request map poisoned");
        let queue = requests.entry(request.ledger_channel_id).or_default();
        let duplicate = queue.iter().any(|r| {
            r.channel_to_be_funded == request.channel_to_be_funded
                && r.kind == request.kind
                && r.status == RequestStatus::Pending
        });
        if !duplicate {
            queue.push(request);
        }
    }

    pub fn requests_for(&self, ledger: ChannelId) -> Vec<LedgerRequest> {
        self.requests
            .lock()
            .expect("request map poisoned")
            .get(&ledger)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_requests(&self) -> Vec<LedgerRequest> {
        self.requests
            .lock()
            .expect("request map poisoned")
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn ledgers_with_pending_requests(&self) -> Vec<ChannelId> {
        self.requests
            .lock()
            .expect("request map poisoned")
            .iter()
            .filter(|(_, queue)| queue.iter().any(|r| r.status == RequestStatus::Pending))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn mark_request(
        &self,
        ledger: ChannelId,
        target: ChannelId,
        kind: RequestKind,
        status: RequestStatus,
    ) {
        let mut requests = self.requests.lock().expect("request map poisoned");
        if let Some(queue) = requests.get_mut(&ledger) {
            for r in queue.iter_mut() {
                if r.channel_to_be_funded == target
                    && r.kind == kind
                    && r.status == RequestStatus::Pending
                {
                    r.status = status;
                }
            }
        }
    }

    /// A pending request was passed over this round.
    pub fn bump_missed_opportunity(&self, ledger: ChannelId, target: ChannelId) {
        let mut requests = self.requests.lock().expect("request map poisoned");
        if let Some(queue) = requests.get_mut(&ledger) {
            for r in queue.iter_mut() {
                if r.channel_to_be_funded == target && r.status == RequestStatus::Pending {
                    r.missed_opportunities += 1;
                }
            }
        }
    }

    pub fn proposal_round(&self, ledger: ChannelId) -> ProposalRound {
        self.proposals
            .lock()
            .expect("proposal map poisoned")
            .get(&ledger)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_my_proposal(&self, proposal: LedgerProposal) {
        let ledger = proposal.ledger_channel_id;
        let mut proposals = self.proposals.lock().expect("proposal map poisoned");
        proposals.entry(ledger).or_default().mine = Some(proposal);
    }

    /// Record the counterparty's proposal. Replays and stale nonces are
    /// dropped; returns whether anything changed.
    pub fn set_their_proposal(&self, proposal: LedgerProposal) -> bool {
        let mut proposals = self.proposals.lock().expect("proposal map poisoned");
        let round = proposals.entry(proposal.ledger_channel_id).or_default();
        match &round.theirs {
            Some(existing) if existing.nonce >= proposal.nonce => false,
            _ => {
                round.theirs = Some(proposal);
                true
            }
        }
    }

    pub fn clear_proposals(&self, ledger: ChannelId) {
        self.proposals
            .lock()
            .expect("proposal map poisoned")
            .remove(&ledger);
    }

    /// Record an outbound message; it stays here until acknowledged.
    pub fn push_outbound(&self, message: AddressedMessage) -> u64 {
        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        let id = outbox.next_id;
        outbox.next_id += 1;
        outbox.messages.push(OutboxEntry { id, message });
        id
    }

    pub fn push_transaction(&self, transaction: ChainTransaction) -> u64 {
        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        let id = outbox.next_id;
        outbox.next_id += 1;
        outbox.transactions.push(TxEntry { id, transaction });
        id
    }

    pub fn unacked_messages(&self) -> Vec<OutboxEntry> {
        self.outbox.lock().expect("outbox poisoned").messages.clone()
    }

    pub fn unacked_transactions(&self) -> Vec<TxEntry> {
        self.outbox
            .lock()
            .expect("outbox poisoned")
            .transactions
            .clone()
    }

    /// Drop one entry once the boundary layer has durably handed it off.
    pub fn ack(&self, id: u64) {
        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        outbox.messages.retain(|e| e.id != id);
        outbox.transactions.retain(|e| e.id != id);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let channels = self
            .channels
            .read()
            .expect("channel map poisoned")
            .values()
            .map(|lease| lease.lock().expect("channel lease poisoned").clone())
            .collect();
        let objectives = self
            .objectives
            .lock()
            .expect("objective map poisoned")
            .values()
            .cloned()
            .collect();
        let outbox = self.outbox.lock().expect("outbox poisoned");
        StoreSnapshot {
            channels,
            objectives,
            requests: self.requests.lock().expect("request map poisoned").clone(),
            proposals: self.proposals.lock().expect("proposal map poisoned").clone(),
            used_nonces: self
                .used_nonces
                .lock()
                .expect("nonce set poisoned")
                .iter()
                .copied()
                .collect(),
            outbox_next_id: outbox.next_id,
            outbox_messages: outbox.messages.clone(),
            outbox_transactions: outbox.transactions.clone(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let channels = snapshot
            .channels
            .into_iter()
            .map(|ch| (ch.channel_id(), Arc::new(Mutex::new(ch))))
            .collect();
        let objectives = snapshot
            .objectives
            .into_iter()
            .map(|o| (o.id.clone(), o))
            .collect();
        Store {
            channels: RwLock::new(channels),
            objectives: Mutex::new(objectives),
            requests: Mutex::new(snapshot.requests),
            proposals: Mutex::new(snapshot.proposals),
            used_nonces: Mutex::new(snapshot.used_nonces.into_iter().collect()),
            outbox: Mutex::new(Outbox {
                next_id: snapshot.outbox_next_id,
                messages: snapshot.outbox_messages,
                transactions: snapshot.outbox_transactions,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConstants, ChannelRole};

    fn channel(nonce: u64) -> Channel {
        let constants = ChannelConstants::new(
            1.into(),
            nonce,
            vec![Address([1; 20]), Address([2; 20])],
            Address::default(),
            60,
        )
        .unwrap();
        Channel::new(constants, 0, ChannelRole::Application)
    }

    #[test]
    fn duplicate_nonce_is_rejected() {
        let store = Store::new();
        store.insert_channel(channel(7)).unwrap();
        // The same channel again is idempotent.
        store.insert_channel(channel(7)).unwrap();

        // A different channel reusing the nonce with the same participants
        // is not.
        let mut other = channel(7);
        other.constants.app_definition = Address([9; 20]);
        assert_eq!(
            store.insert_channel(other).unwrap_err(),
            ValidationError::DuplicateChannelNonce
        );

        store.insert_channel(channel(8)).unwrap();
    }

    #[test]
    fn duplicate_pending_requests_merge() {
        let store = Store::new();
        let ledger = Hash([1; 32]);
        let target = Hash([2; 32]);
        store.enqueue_request(LedgerRequest::new(ledger, target, RequestKind::Fund));
        store.enqueue_request(LedgerRequest::new(ledger, target, RequestKind::Fund));
        assert_eq!(store.requests_for(ledger).len(), 1);

        // A defund for the same target is a different ask.
        store.enqueue_request(LedgerRequest::new(ledger, target, RequestKind::Defund));
        assert_eq!(store.requests_for(ledger).len(), 2);
    }

    #[test]
    fn stale_counterparty_proposals_are_dropped() {
        let store = Store::new();
        let ledger = Hash([1; 32]);
        let proposal = LedgerProposal {
            ledger_channel_id: ledger,
            outcome: crate::outcome::Allocation {
                asset: Address::default(),
                items: vec![],
            },
            nonce: 2,
            proposer: Address([3; 20]),
        };
        assert!(store.set_their_proposal(proposal.clone()));
        assert!(!store.set_their_proposal(proposal.clone()));

        let stale = LedgerProposal {
            nonce: 1,
            ..proposal
        };
        assert!(!store.set_their_proposal(stale));
    }

    #[test]
    fn outbox_survives_a_snapshot_roundtrip() {
        let store = Store::new();
        store.insert_channel(channel(3)).unwrap();
        let id = store.push_outbound(AddressedMessage {
            to: Address([2; 20]),
            message: crate::messages::Message::new(1),
        });

        let bytes = bincode::serialize(&store.snapshot()).unwrap();
        let restored: StoreSnapshot = bincode::deserialize(&bytes).unwrap();
        let restored = Store::from_snapshot(restored);

        assert_eq!(restored.unacked_messages().len(), 1);
        assert_eq!(restored.channel_ids().len(), 1);

        restored.ack(id);
        assert!(restored.unacked_messages().is_empty());
    }
}
