use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssz::{Decode, DecodeError, Encode};
use std::fmt;
use std::str::FromStr;
use tree_hash::{PackedEncoding, TreeHash, TreeHashType};

pub const GRAFFITI_BYTES_LEN: usize = 32;

/// The 32-byte graffiti field embedded in proposed blocks, serialised as
/// 0x-prefixed hex on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Graffiti(pub [u8; GRAFFITI_BYTES_LEN]);

impl Graffiti {
    pub fn as_utf8_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .trim_end_matches('\0')
            .to_string()
    }
}

impl fmt::Display for Graffiti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Graffiti {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}", self))
    }
}

impl<'de> Deserialize<'de> for Graffiti {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s
            .strip_prefix("0x")
            .ok_or_else(|| D::Error::custom("graffiti must start with 0x"))?;
        let bytes = hex::decode(stripped).map_err(D::Error::custom)?;
        let bytes: [u8; GRAFFITI_BYTES_LEN] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("graffiti must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl Encode for Graffiti {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        GRAFFITI_BYTES_LEN
    }

    fn ssz_bytes_len(&self) -> usize {
        GRAFFITI_BYTES_LEN
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0)
    }
}

impl Decode for Graffiti {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        GRAFFITI_BYTES_LEN
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| DecodeError::InvalidByteLength {
                len: bytes.len(),
                expected: GRAFFITI_BYTES_LEN,
            })
    }
}

impl TreeHash for Graffiti {
    fn tree_hash_type() -> TreeHashType {
        TreeHashType::Vector
    }

    fn tree_hash_packed_encoding(&self) -> PackedEncoding {
        unreachable!("Vector should never be packed.")
    }

    fn tree_hash_packing_factor() -> usize {
        unreachable!("Vector should never be packed.")
    }

    fn tree_hash_root(&self) -> tree_hash::Hash256 {
        tree_hash::merkle_root(&self.0, 1)
    }
}

/// A UTF-8 string no longer than 32 bytes, as accepted on the command line
/// and via the keymanager collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GraffitiString(String);

impl FromStr for GraffitiString {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > GRAFFITI_BYTES_LEN {
            return Err(format!(
                "Graffiti exceeds max length {}",
                GRAFFITI_BYTES_LEN
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for GraffitiString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(D::Error::custom)
    }
}

impl From<GraffitiString> for Graffiti {
    fn from(from: GraffitiString) -> Self {
        let mut bytes = [0; GRAFFITI_BYTES_LEN];
        let utf8 = from.0.as_bytes();
        bytes[..utf8.len()].copy_from_slice(utf8);
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_utf8_to_32_bytes() {
        let graffiti: Graffiti = GraffitiString::from_str("vero").unwrap().into();
        assert_eq!(&graffiti.0[..4], b"vero");
        assert!(graffiti.0[4..].iter().all(|b| *b == 0));
        assert_eq!(graffiti.as_utf8_lossy(), "vero");
    }

    #[test]
    fn rejects_over_long_strings() {
        assert!(GraffitiString::from_str(&"x".repeat(33)).is_err());
    }

    #[test]
    fn hex_serde_round_trip() {
        let graffiti: Graffiti = GraffitiString::from_str("hello").unwrap().into();
        let json = serde_json::to_string(&graffiti).unwrap();
        let back: Graffiti = serde_json::from_str(&json).unwrap();
        assert_eq!(graffiti, back);
    }
}
