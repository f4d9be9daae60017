//! Fixed-size byte types and the 256-bit unsigned integer used throughout.
//!
//! All of them serialize as raw bytes so the wire encoding stays compact and
//! deterministic.

use core::fmt::Debug;
use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Serialize};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct BytesVisitor;

                impl<'de> de::Visitor<'de> for BytesVisitor {
                    type Value = $T;

                    fn expecting(
                        &self,
                        f: &mut core::fmt::Formatter<'_>,
                    ) -> core::fmt::Result {
                        write!(f, "{} bytes", $N)
                    }

                    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<$T, E> {
                        let bytes: [u8; $N] = v
                            .try_into()
                            .map_err(|_| E::invalid_length(v.len(), &self))?;
                        Ok($T(bytes))
                    }

                    fn visit_seq<A: de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<$T, A::Error> {
                        let mut bytes = [0u8; $N];
                        for (i, b) in bytes.iter_mut().enumerate() {
                            *b = seq
                                .next_element()?
                                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                        }
                        Ok($T(bytes))
                    }
                }

                deserializer.deserialize_bytes(BytesVisitor)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Hash, 32);
bytes_newtype!(Address, 20);
bytes_newtype!(Signature, 65);

/// A channel is identified by the hash of its constants.
pub type ChannelId = Hash;

// Where an outcome item pays out to: either an external address (left-padded
// to 32 bytes) or another channel.
bytes_newtype!(Destination, 32);

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        // Addresses are right-aligned, like uints.
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(bytes)
    }
}

impl From<ChannelId> for Destination {
    fn from(id: ChannelId) -> Self {
        Destination(id.0)
    }
}

impl Destination {
    /// Reinterpret as a channel id. Only meaningful when the destination is
    /// known to be a channel, which callers establish from context.
    pub fn as_channel_id(&self) -> ChannelId {
        Hash(self.0)
    }
}

// primitive_types::U256 would work too, but it serde-serializes to a hex
// string; raw big-endian bytes keep frames compact and roundtrip exactly.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct U256Visitor;

        impl<'de> de::Visitor<'de> for U256Visitor {
            type Value = U256;

            fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("32 big-endian bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<U256, E> {
                if v.len() != 32 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                Ok(U256::from_big_endian(v))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<U256, A::Error> {
                let mut bytes = [0u8; 32];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(U256::from_big_endian(&bytes))
            }
        }

        deserializer.deserialize_bytes(U256Visitor)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn byte_types_roundtrip_through_bincode() {
        let mut rng = StdRng::seed_from_u64(0);
        let hash: Hash = rng.gen();
        let addr: Address = rng.gen();
        let sig: Signature = rng.gen();

        let decoded: Hash = bincode::deserialize(&bincode::serialize(&hash).unwrap()).unwrap();
        assert_eq!(decoded, hash);
        let decoded: Address = bincode::deserialize(&bincode::serialize(&addr).unwrap()).unwrap();
        assert_eq!(decoded, addr);
        let decoded: Signature = bincode::deserialize(&bincode::serialize(&sig).unwrap()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn u256_roundtrips_through_bincode() {
        let mut rng = StdRng::seed_from_u64(1);
        let value: U256 = rng.gen();
        let decoded: U256 = bincode::deserialize(&bincode::serialize(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let encoded = bincode::serialize(&Address([7; 20])).unwrap();
        assert!(bincode::deserialize::<Hash>(&encoded).is_err());
    }

    #[test]
    fn address_destinations_are_left_padded() {
        let addr = Address([0xab; 20]);
        let dest: Destination = addr.into();
        assert_eq!(&dest.0[..12], &[0u8; 12]);
        assert_eq!(&dest.0[12..], &addr.0);
    }

    #[test]
    fn channel_destinations_roundtrip() {
        let id = Hash([0xcd; 32]);
        let dest: Destination = id.into();
        assert_eq!(dest.as_channel_id(), id);
    }

    #[test]
    fn debug_prints_hex() {
        let addr = Address([0x0f; 20]);
        assert_eq!(format!("{addr:?}"), format!("0x{}", hex::encode(addr.0)));
        assert!(format!("{:?}", Hash([0; 32])).starts_with("0x00"));
    }
}
