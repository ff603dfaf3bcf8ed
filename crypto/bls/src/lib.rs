//! Wire-format BLS containers.
//!
//! This client never holds private keys: every signature is produced by a
//! remote signer. Public keys and signatures therefore exist here only as
//! fixed-size byte containers with the serialisation impls the rest of the
//! workspace needs, plus the hash prefix used for aggregator selection.

use sha2::{Digest, Sha256};

pub const PUBLIC_KEY_BYTES_LEN: usize = 48;
pub const SIGNATURE_BYTES_LEN: usize = 96;

/// Interprets the first eight bytes of `sha256(bytes)` as a little-endian
/// integer. This is the value the consensus spec reduces modulo the
/// committee modulo to decide aggregator election.
pub fn hash_prefix_to_u64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[0..8]);
    u64::from_le_bytes(prefix)
}

/// Defines a fixed-size byte container with hex serde, SSZ and tree-hash
/// impls. The expanding crate must depend on `serde`, `hex`, `ssz` and
/// `tree_hash`.
#[macro_export]
macro_rules! bytes_struct {
    ($name:ident, $byte_size:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy)]
        pub struct $name([u8; $byte_size]);

        impl $name {
            pub fn empty() -> Self {
                Self([0; $byte_size])
            }

            pub fn deserialize(bytes: &[u8]) -> Result<Self, String> {
                if bytes.len() != $byte_size {
                    return Err(format!(
                        "Invalid byte length {}, expected {}",
                        bytes.len(),
                        $byte_size
                    ));
                }
                let mut out = [0; $byte_size];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub fn serialize(&self) -> [u8; $byte_size] {
                self.0
            }

            pub fn as_hex_string(&self) -> String {
                format!("{}", self)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "0x{}", ::hex::encode(self.0))
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "0x{}", ::hex::encode(self.0))
            }
        }

        impl ::std::cmp::PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0[..] == other.0[..]
            }
        }

        impl ::std::cmp::Eq for $name {}

        impl ::std::hash::Hash for $name {
            fn hash<H: ::std::hash::Hasher>(&self, state: &mut H) {
                self.0[..].hash(state);
            }
        }

        impl ::std::cmp::PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<::std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl ::std::cmp::Ord for $name {
            fn cmp(&self, other: &Self) -> ::std::cmp::Ordering {
                self.0[..].cmp(&other.0[..])
            }
        }

        impl ::std::default::Default for $name {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let stripped = s
                    .strip_prefix("0x")
                    .ok_or_else(|| format!("{} must start with 0x", stringify!($name)))?;
                let bytes =
                    ::hex::decode(stripped).map_err(|e| format!("Invalid hex: {:?}", e))?;
                Self::deserialize(&bytes)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.as_hex_string())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                <$name as ::std::str::FromStr>::from_str(&s)
                    .map_err(<D::Error as ::serde::de::Error>::custom)
            }
        }

        impl ::ssz::Encode for $name {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $byte_size
            }

            fn ssz_bytes_len(&self) -> usize {
                $byte_size
            }

            fn ssz_append(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.0)
            }
        }

        impl ::ssz::Decode for $name {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $byte_size
            }

            fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ::ssz::DecodeError> {
                Self::deserialize(bytes).map_err(|_| ::ssz::DecodeError::InvalidByteLength {
                    len: bytes.len(),
                    expected: $byte_size,
                })
            }
        }

        impl ::tree_hash::TreeHash for $name {
            fn tree_hash_type() -> ::tree_hash::TreeHashType {
                ::tree_hash::TreeHashType::Vector
            }

            fn tree_hash_packed_encoding(&self) -> ::tree_hash::PackedEncoding {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_packing_factor() -> usize {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_root(&self) -> ::tree_hash::Hash256 {
                let minimum_chunk_count = ($byte_size + ::tree_hash::BYTES_PER_CHUNK - 1)
                    / ::tree_hash::BYTES_PER_CHUNK;
                ::tree_hash::merkle_root(&self.0, minimum_chunk_count)
            }
        }
    };
}

bytes_struct!(
    PublicKeyBytes,
    PUBLIC_KEY_BYTES_LEN,
    "The wire form of a BLS public key."
);
bytes_struct!(
    SignatureBytes,
    SIGNATURE_BYTES_LEN,
    "The wire form of a BLS signature."
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn pubkey_hex_round_trip() {
        let mut raw = [0u8; PUBLIC_KEY_BYTES_LEN];
        raw[0] = 0xab;
        raw[47] = 0x01;
        let pubkey = PublicKeyBytes::deserialize(&raw).unwrap();
        let parsed = PublicKeyBytes::from_str(&pubkey.as_hex_string()).unwrap();
        assert_eq!(pubkey, parsed);
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert!(PublicKeyBytes::deserialize(&[0u8; 47]).is_err());
        assert!(SignatureBytes::from_str("0x0011").is_err());
    }

    #[test]
    fn hash_prefix_is_deterministic() {
        let sig = SignatureBytes::empty();
        assert_eq!(
            hash_prefix_to_u64(&sig.serialize()),
            hash_prefix_to_u64(&sig.serialize())
        );
    }
}
