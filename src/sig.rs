//! Handles the creation and verification of (Ethereum-style) signatures and
//! serializes all signing requests through a single signing identity.

use crate::error::SigError;
use crate::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};
use std::sync::{Condvar, Mutex, RwLock};

mod k256;
pub use self::k256::{recover_signer, Signer};

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the adjudicator contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => plain hasher, no structured encoding
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Serializes every sign request against the node's signing identity.
///
/// At most one sign request executes at a time, granted in FIFO order. Two
/// concurrently constructed proposals for the same turn number must never
/// both obtain signatures, which is what the turnstile below prevents.
#[derive(Debug)]
pub struct SigningService {
    identity: RwLock<Option<Signer>>,
    turnstile: Turnstile,
}

#[derive(Debug, Default)]
struct Turnstile {
    tickets: Mutex<TicketCounters>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct TicketCounters {
    next: u64,
    serving: u64,
}

impl SigningService {
    /// A service with no identity configured. Every `sign` call fails with
    /// [SigError::SigningUnavailable] until [SigningService::install] runs.
    pub fn unconfigured() -> Self {
        SigningService {
            identity: RwLock::new(None),
            turnstile: Turnstile::default(),
        }
    }

    pub fn new(signer: Signer) -> Self {
        SigningService {
            identity: RwLock::new(Some(signer)),
            turnstile: Turnstile::default(),
        }
    }

    /// Installs the signing identity at bootstrap. The engine has exactly
    /// one; installing again replaces it, which only tests should do.
    pub fn install(&self, signer: Signer) {
        *self.identity.write().expect("identity lock poisoned") = Some(signer);
    }

    pub fn address(&self) -> Result<Address, SigError> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .as_ref()
            .map(Signer::address)
            .ok_or(SigError::SigningUnavailable)
    }

    /// Sign a state hash. Requests are granted strictly in arrival order.
    pub fn sign(&self, msg: Hash) -> Result<Signature, SigError> {
        let ticket = {
            let mut counters = self.turnstile.tickets.lock().expect("turnstile poisoned");
            let ticket = counters.next;
            counters.next += 1;
            ticket
        };

        let mut counters = self.turnstile.tickets.lock().expect("turnstile poisoned");
        while counters.serving != ticket {
            counters = self
                .turnstile
                .turn
                .wait(counters)
                .expect("turnstile poisoned");
        }

        let result = self
            .identity
            .read()
            .expect("identity lock poisoned")
            .as_ref()
            .map(|signer| signer.sign_eth(msg))
            .ok_or(SigError::SigningUnavailable);

        counters.serving += 1;
        drop(counters);
        self.turnstile.turn.notify_all();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn sign_and_recover_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = Signer::new(&mut rng);
        let addr = signer.address();
        let service = SigningService::new(signer);

        let msg = Hash([7; 32]);
        let sig = service.sign(msg).unwrap();
        assert_eq!(recover_signer(msg, sig).unwrap(), addr);
    }

    #[test]
    fn unconfigured_service_refuses_to_sign() {
        let service = SigningService::unconfigured();
        assert_eq!(
            service.sign(Hash([1; 32])).unwrap_err(),
            SigError::SigningUnavailable
        );
    }

    #[test]
    fn recover_rejects_garbage() {
        let sig = Signature([0xff; 65]);
        assert!(recover_signer(Hash([2; 32]), sig).is_err());
    }

    #[test]
    fn wrong_signer_is_detected() {
        let mut rng = StdRng::seed_from_u64(1);
        let honest = Signer::new(&mut rng);
        let imposter = Signer::new(&mut rng);

        let msg = Hash([9; 32]);
        let sig = imposter.sign_eth(msg);
        let recovered = recover_signer(msg, sig).unwrap();
        assert_ne!(recovered, honest.address());
        assert_eq!(recovered, imposter.address());
    }

    #[test]
    fn concurrent_sign_requests_all_complete() {
        let mut rng = StdRng::seed_from_u64(2);
        let service = Arc::new(SigningService::new(Signer::new(&mut rng)));

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || service.sign(Hash([i; 32])).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
