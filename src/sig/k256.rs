//! Signing identity backed by the k256 crate (pure-Rust ECDSA).

use super::hash_to_eth_signed_msg_hash;
use crate::error::SigError;
use crate::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as K256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

/// One signing identity: a secp256k1 private key plus its derived address.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

fn address_of(key: &VerifyingKey) -> Address {
    // Convert the key into an EncodedPoint (on the curve), which has the
    // data we need in bytes [1..]. The first byte is an encoding tag added
    // by serialize_uncompressed, not part of the public key.
    let pk_bytes: [u8; 65] = key
        .to_encoded_point(false)
        .as_bytes()
        .try_into()
        .expect("uncompressed secp256k1 point is 65 bytes");

    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = address_of(&key.verifying_key());
        Self { key, addr }
    }

    /// Build a signer from raw private key bytes, for deterministic setups.
    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, SigError> {
        let key = SigningKey::from_bytes(private_key).map_err(|_| SigError::MalformedSignature)?;
        let addr = address_of(&key.verifying_key());
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self
            .key
            .sign_prehash(&hash.0)
            .expect("prehash is exactly 32 bytes");

        // The recoverable signature is already 65 bytes of r, s, v in this
        // order, but v needs +27 to be valid for the EVM.
        let mut sig_bytes: [u8; 65] = sig
            .as_bytes()
            .try_into()
            .expect("recoverable signature is 65 bytes");
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }
}

/// Recover the address that signed `msg`. Pure and stateless; fails only on
/// malformed signature bytes.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, SigError> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo the +27 on v before handing the bytes to k256.
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    if sig_bytes[64] < 27 {
        return Err(SigError::MalformedSignature);
    }
    sig_bytes[64] -= 27;

    let sig = recoverable::Signature::from_bytes(&sig_bytes)
        .map_err(|_| SigError::MalformedSignature)?;

    let verifying_key = sig
        .recover_verifying_key_from_digest_bytes(&hash.0.into())
        .map_err(|_| SigError::MalformedSignature)?;
    Ok(address_of(&verifying_key))
}
