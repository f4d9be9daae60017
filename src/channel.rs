//! The channel data model: immutable channel constants, per-turn state
//! variants, signed states and the rules that decide when a state becomes
//! supported.
//!
//! Everything here is pure. The store owns persistence; the objective
//! runtime decides what gets persisted.

use crate::error::{ProtocolError, ValidationError};
use thiserror::Error;
use crate::outcome::Outcome;
use crate::sig::recover_signer;
use crate::types::{Address, ChannelId, Hash, Signature, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, BTreeSet};

/// Index of a participant in the channel. `0` proposed the channel.
pub type PartIdx = usize;

/// The immutable identity of a channel. Hashing these yields the channel id;
/// the nonce must never repeat for the same participant set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelConstants {
    pub chain_id: U256,
    pub channel_nonce: u64,
    pub participants: Vec<Address>,
    pub app_definition: Address,
    pub challenge_duration: u64,
}

impl ChannelConstants {
    pub fn new(
        chain_id: U256,
        channel_nonce: u64,
        participants: Vec<Address>,
        app_definition: Address,
        challenge_duration: u64,
    ) -> Result<Self, ValidationError> {
        if participants.len() < 2 {
            return Err(ValidationError::InvalidParticipantSet);
        }
        let distinct: BTreeSet<_> = participants.iter().collect();
        if distinct.len() != participants.len() {
            return Err(ValidationError::InvalidParticipantSet);
        }
        Ok(ChannelConstants {
            chain_id,
            channel_nonce,
            participants,
            app_definition,
            challenge_duration,
        })
    }

    /// Deterministic channel id: keccak256 over the channel's identity.
    pub fn channel_id(&self) -> ChannelId {
        let mut h = Keccak256::new();
        let mut buf = [0u8; 32];
        self.chain_id.to_big_endian(&mut buf);
        h.update(buf);
        h.update(self.channel_nonce.to_be_bytes());
        h.update((self.participants.len() as u32).to_be_bytes());
        for p in &self.participants {
            h.update(p.0);
        }
        h.update(self.app_definition.0);
        Hash(h.finalize().into())
    }

    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.participants.iter().position(|&p| p == addr)
    }
}

/// The variable part of a state: what changes turn by turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StateVars {
    pub turn_num: u32,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

/// One proposed version of a channel at a given turn number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub constants: ChannelConstants,
    pub vars: StateVars,
}

impl State {
    pub fn channel_id(&self) -> ChannelId {
        self.constants.channel_id()
    }

    pub fn turn_num(&self) -> u32 {
        self.vars.turn_num
    }

    /// The hash participants sign. Domain-separates every variable-length
    /// field with a length prefix so distinct states never collide.
    pub fn state_hash(&self) -> Hash {
        let mut h = Keccak256::new();
        h.update(self.channel_id().0);
        h.update(self.vars.turn_num.to_be_bytes());
        h.update([self.vars.is_final as u8]);
        hash_outcome(&mut h, &self.vars.outcome);
        h.update((self.vars.app_data.len() as u32).to_be_bytes());
        h.update(&self.vars.app_data);
        Hash(h.finalize().into())
    }

    /// The successor state template: same channel, next turn.
    pub fn make_next(&self) -> State {
        State {
            constants: self.constants.clone(),
            vars: StateVars {
                turn_num: self.vars.turn_num + 1,
                outcome: self.vars.outcome.clone(),
                app_data: self.vars.app_data.clone(),
                is_final: self.vars.is_final,
            },
        }
    }
}

fn hash_outcome(h: &mut Keccak256, outcome: &Outcome) {
    match outcome {
        Outcome::Allocation(a) => {
            h.update([0u8]);
            h.update(a.asset.0);
            h.update((a.items.len() as u32).to_be_bytes());
            let mut buf = [0u8; 32];
            for item in &a.items {
                h.update(item.destination.0);
                item.amount.to_big_endian(&mut buf);
                h.update(buf);
            }
        }
        Outcome::Guarantee(g) => {
            h.update([1u8]);
            h.update(g.asset.0);
            h.update(g.target_channel.0);
            h.update((g.destinations.len() as u32).to_be_bytes());
            for d in &g.destinations {
                h.update(d.0);
            }
        }
    }
}

/// A state plus the signatures collected for it so far, keyed by
/// participant index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub state: State,
    pub signatures: BTreeMap<PartIdx, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        SignedState {
            state,
            signatures: BTreeMap::new(),
        }
    }

    /// Verify and record one signature. Signing the same state twice with
    /// the same signature is a no-op; a different signature for the same
    /// index is rejected.
    pub fn add_signature(&mut self, sig: Signature) -> Result<PartIdx, ValidationError> {
        let signer = recover_signer(self.state.state_hash(), sig)
            .map_err(|_| ValidationError::MalformedSignature)?;
        let part_idx = self
            .state
            .constants
            .index_of(signer)
            .ok_or(ValidationError::SignatureFromNonParticipant(signer))?;

        match self.signatures.get(&part_idx) {
            Some(existing) if *existing == sig => Ok(part_idx),
            Some(_) => Err(ValidationError::InconsistentStateContent),
            None => {
                self.signatures.insert(part_idx, sig);
                Ok(part_idx)
            }
        }
    }

    /// A state is supported once every participant signed exactly this
    /// content. Support is the sole authorization for acting on a state.
    pub fn is_supported(&self) -> bool {
        (0..self.state.constants.participants.len())
            .all(|idx| self.signatures.contains_key(&idx))
    }

    pub fn signed_by(&self, part_idx: PartIdx) -> bool {
        self.signatures.contains_key(&part_idx)
    }
}

/// What the channel is used for; decides which progression rule applies and
/// how it gets funded or defunded.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// A directly funded application channel.
    Application,
    /// A shared ledger funding other channels through consensus rounds.
    Ledger,
    /// Earmarks ledger funds in support of a joint channel.
    Guarantor,
    /// A virtual channel between leaf parties, backed by guarantors.
    Joint,
}

/// How incoming turn numbers are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progression {
    /// Exactly the next turn number is acceptable.
    Sequential,
    /// Any turn above the supported one is acceptable (ledger consensus
    /// rounds may skip numbers when proposals get dismissed).
    Consensus,
}

/// Where a channel's funds come from, which decides how it is defunded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum FundingSource {
    /// Deposits straight into the adjudicator.
    #[default]
    Direct,
    /// An allocation item in a shared ledger channel.
    Ledger(ChannelId),
    /// Guarantor channels, one per hop, each earmarking funds in the ledger
    /// at the same position.
    Virtual {
        guarantors: Vec<ChannelId>,
        ledgers: Vec<ChannelId>,
    },
}

/// On-chain adjudication status, updated only by chain events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjudicatorStatus {
    #[default]
    Open,
    Challenged {
        finalizes_at: u64,
    },
    Finalized,
}

/// Error folding an incoming signed state into a channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AddStateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<AddStateError> for crate::error::EngineError {
    fn from(err: AddStateError) -> Self {
        match err {
            AddStateError::Validation(e) => e.into(),
            AddStateError::Protocol(e) => e.into(),
        }
    }
}

/// The persisted per-channel aggregate: constants, every observed state and
/// the on-chain view. New observed states append; nothing mutates in place.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Channel {
    pub constants: ChannelConstants,
    pub my_index: PartIdx,
    pub role: ChannelRole,
    /// Observed signed states, keyed by turn number.
    states: BTreeMap<u32, SignedState>,
    /// On-chain holdings per asset holder.
    pub funding: BTreeMap<Address, U256>,
    pub funded_by: FundingSource,
    pub adjudicator_status: AdjudicatorStatus,
}

impl Channel {
    pub fn new(constants: ChannelConstants, my_index: PartIdx, role: ChannelRole) -> Self {
        Channel {
            constants,
            my_index,
            role,
            states: BTreeMap::new(),
            funding: BTreeMap::new(),
            funded_by: FundingSource::Direct,
            adjudicator_status: AdjudicatorStatus::Open,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.constants.channel_id()
    }

    pub fn my_address(&self) -> Address {
        self.constants.participants[self.my_index]
    }

    pub fn progression(&self) -> Progression {
        match self.role {
            ChannelRole::Ledger => Progression::Consensus,
            _ => Progression::Sequential,
        }
    }

    /// The latest supported state, if any.
    pub fn supported(&self) -> Option<&SignedState> {
        self.states
            .values()
            .rev()
            .find(|ss| ss.is_supported())
    }

    pub fn latest_signed_by_me(&self) -> Option<&SignedState> {
        self.states
            .values()
            .rev()
            .find(|ss| ss.signed_by(self.my_index))
    }

    pub fn latest(&self) -> Option<&SignedState> {
        self.states.values().next_back()
    }

    pub fn state_at(&self, turn_num: u32) -> Option<&SignedState> {
        self.states.get(&turn_num)
    }

    /// Highest supported turn number plus one; `0` before anything is
    /// supported.
    pub fn next_turn_num(&self) -> u32 {
        self.supported().map_or(0, |ss| ss.state.turn_num() + 1)
    }

    /// Validate and fold in an incoming signed state. Signatures for an
    /// already known turn merge if the content matches; new turns must obey
    /// the channel's progression rule. Returns whether the affected state is
    /// now supported.
    pub fn add_signed_state(&mut self, incoming: SignedState) -> Result<bool, AddStateError> {
        let turn = incoming.state.turn_num();

        if let Some(existing) = self.states.get_mut(&turn) {
            if existing.state != incoming.state {
                // Same turn, different content: the peer committed to
                // something incompatible with what is already recorded.
                return Err(ProtocolError::ConflictingSupportedState(
                    self.constants.channel_id(),
                )
                .into());
            }
            for (_, sig) in incoming.signatures {
                existing.add_signature(sig)?;
            }
            return Ok(existing.is_supported());
        }

        self.check_turn_num(turn)?;

        let supported = incoming.is_supported();
        self.states.insert(turn, incoming);
        Ok(supported)
    }

    /// Whether a state with this turn number would be accepted right now.
    /// Used to reject stale input before any mutation.
    pub fn check_turn_num(&self, turn: u32) -> Result<(), ValidationError> {
        if self.states.contains_key(&turn) {
            return Ok(());
        }
        let expected = self.next_turn_num();
        let acceptable = match self.progression() {
            Progression::Sequential => turn == expected,
            Progression::Consensus => turn >= expected,
        };
        if acceptable {
            Ok(())
        } else {
            Err(ValidationError::StaleTurnNumber {
                expected,
                got: turn,
            })
        }
    }

    pub fn total_funding(&self) -> U256 {
        self.funding
            .values()
            .fold(U256::zero(), |acc, amount| acc + *amount)
    }

    /// Funded means on-chain holdings cover the supported outcome in full.
    pub fn fully_funded(&self) -> bool {
        match self.supported() {
            Some(ss) => self.total_funding() >= ss.state.vars.outcome.total(),
            None => false,
        }
    }

    /// The channel concluded off-chain: a final state is supported.
    pub fn concluded(&self) -> bool {
        self.supported()
            .map_or(false, |ss| ss.state.vars.is_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::sig::Signer;
    use rand::{rngs::StdRng, SeedableRng};

    fn two_party_setup() -> (Signer, Signer, ChannelConstants) {
        let mut rng = StdRng::seed_from_u64(42);
        let a = Signer::new(&mut rng);
        let b = Signer::new(&mut rng);
        let constants = ChannelConstants::new(
            1.into(),
            7,
            vec![a.address(), b.address()],
            Address::default(),
            60,
        )
        .unwrap();
        (a, b, constants)
    }

    fn state_at_turn(constants: &ChannelConstants, turn_num: u32) -> State {
        State {
            constants: constants.clone(),
            vars: StateVars {
                turn_num,
                outcome: Outcome::simple(
                    Address::default(),
                    vec![(Address([1; 20]).into(), 5.into())],
                ),
                app_data: vec![],
                is_final: false,
            },
        }
    }

    #[test]
    fn channel_id_is_deterministic_and_nonce_sensitive() {
        let (_, _, constants) = two_party_setup();
        assert_eq!(constants.channel_id(), constants.channel_id());

        let mut other = constants.clone();
        other.channel_nonce += 1;
        assert_ne!(constants.channel_id(), other.channel_id());
    }

    #[test]
    fn participant_set_is_validated() {
        let addr = Address([3; 20]);
        assert_eq!(
            ChannelConstants::new(1.into(), 0, vec![addr], Address::default(), 60).unwrap_err(),
            ValidationError::InvalidParticipantSet
        );
        assert_eq!(
            ChannelConstants::new(1.into(), 0, vec![addr, addr], Address::default(), 60)
                .unwrap_err(),
            ValidationError::InvalidParticipantSet
        );
    }

    #[test]
    fn support_requires_every_participant() {
        let (a, b, constants) = two_party_setup();
        let state = state_at_turn(&constants, 0);
        let mut ss = SignedState::new(state.clone());

        ss.add_signature(a.sign_eth(state.state_hash())).unwrap();
        assert!(!ss.is_supported());
        ss.add_signature(b.sign_eth(state.state_hash())).unwrap();
        assert!(ss.is_supported());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let (_, _, constants) = two_party_setup();
        let mut rng = StdRng::seed_from_u64(99);
        let outsider = Signer::new(&mut rng);

        let state = state_at_turn(&constants, 0);
        let mut ss = SignedState::new(state.clone());
        let err = ss
            .add_signature(outsider.sign_eth(state.state_hash()))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SignatureFromNonParticipant(_)
        ));
    }

    #[test]
    fn duplicate_signature_is_a_noop() {
        let (a, _, constants) = two_party_setup();
        let state = state_at_turn(&constants, 0);
        let mut ss = SignedState::new(state.clone());
        let sig = a.sign_eth(state.state_hash());
        ss.add_signature(sig).unwrap();
        ss.add_signature(sig).unwrap();
        assert_eq!(ss.signatures.len(), 1);
    }

    #[test]
    fn sequential_progression_enforces_exact_next_turn() {
        let (a, b, constants) = two_party_setup();
        let mut channel = Channel::new(constants.clone(), 0, ChannelRole::Application);

        let state0 = state_at_turn(&constants, 0);
        let mut ss0 = SignedState::new(state0.clone());
        ss0.add_signature(a.sign_eth(state0.state_hash())).unwrap();
        ss0.add_signature(b.sign_eth(state0.state_hash())).unwrap();
        assert!(channel.add_signed_state(ss0).unwrap());
        assert_eq!(channel.next_turn_num(), 1);

        // Turn 2 skips turn 1.
        assert_eq!(
            channel.check_turn_num(2).unwrap_err(),
            ValidationError::StaleTurnNumber {
                expected: 1,
                got: 2
            }
        );
        // Re-offering turn 0 content merges, lower fresh turns are stale.
        assert!(channel.check_turn_num(0).is_ok());
    }

    #[test]
    fn conflicting_state_at_same_turn_is_detected() {
        let (a, b, constants) = two_party_setup();
        let mut channel = Channel::new(constants.clone(), 0, ChannelRole::Application);

        let state = state_at_turn(&constants, 0);
        let mut ss = SignedState::new(state.clone());
        ss.add_signature(a.sign_eth(state.state_hash())).unwrap();
        channel.add_signed_state(ss).unwrap();

        let mut other = state_at_turn(&constants, 0);
        other.vars.app_data = vec![0xde, 0xad];
        let mut conflicting = SignedState::new(other.clone());
        conflicting
            .add_signature(b.sign_eth(other.state_hash()))
            .unwrap();

        assert!(matches!(
            channel.add_signed_state(conflicting).unwrap_err(),
            AddStateError::Protocol(ProtocolError::ConflictingSupportedState(_))
        ));
    }

    #[test]
    fn consensus_progression_accepts_higher_turns() {
        let (a, b, constants) = two_party_setup();
        let mut channel = Channel::new(constants.clone(), 0, ChannelRole::Ledger);

        let state0 = state_at_turn(&constants, 0);
        let mut ss0 = SignedState::new(state0.clone());
        ss0.add_signature(a.sign_eth(state0.state_hash())).unwrap();
        ss0.add_signature(b.sign_eth(state0.state_hash())).unwrap();
        channel.add_signed_state(ss0).unwrap();

        // Turn 3 is fine for a ledger even though 1 and 2 never existed.
        let state3 = state_at_turn(&constants, 3);
        let mut ss3 = SignedState::new(state3.clone());
        ss3.add_signature(a.sign_eth(state3.state_hash())).unwrap();
        assert!(!channel.add_signed_state(ss3).unwrap());
        assert_eq!(channel.next_turn_num(), 1);
    }

    #[test]
    fn funding_covers_supported_outcome() {
        let (a, b, constants) = two_party_setup();
        let mut channel = Channel::new(constants.clone(), 0, ChannelRole::Application);

        let state = state_at_turn(&constants, 0);
        let mut ss = SignedState::new(state.clone());
        ss.add_signature(a.sign_eth(state.state_hash())).unwrap();
        ss.add_signature(b.sign_eth(state.state_hash())).unwrap();
        channel.add_signed_state(ss).unwrap();

        assert!(!channel.fully_funded());
        channel.funding.insert(Address::default(), 5.into());
        assert!(channel.fully_funded());
    }
}
