use crate::{ChainSpec, Epoch, Hash256, Slot};
use bls::SignatureBytes;
use serde::{Deserialize, Serialize};
use ssz_types::typenum::U2048;
use ssz_types::{BitList, VariableList};
use ssz_derive::{Decode, Encode};
use tree_hash_derive::TreeHash;

/// Index of a committee within a slot.
pub type CommitteeIndex = u64;

pub type MaxValidatorsPerCommittee = U2048;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash,
)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash256,
}

/// The data a validator attests to.
///
/// The canonical SSZ encoding of this container doubles as the vote key the
/// coordinator counts when establishing cross-beacon-node consensus.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash,
)]
pub struct AttestationData {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: CommitteeIndex,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Attestation {
    pub aggregation_bits: BitList<MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

impl Attestation {
    /// An unsigned attestation with a single participation bit set, ready
    /// to be passed to the signer.
    pub fn empty_for_signing(
        data: AttestationData,
        committee_length: usize,
        committee_position: usize,
    ) -> Result<Self, String> {
        let mut aggregation_bits = BitList::with_capacity(committee_length)
            .map_err(|e| format!("Invalid committee length: {:?}", e))?;
        aggregation_bits
            .set(committee_position, true)
            .map_err(|e| format!("Invalid committee position: {:?}", e))?;
        Ok(Self {
            aggregation_bits,
            data,
            signature: SignatureBytes::empty(),
        })
    }

    /// The number of participating validators.
    pub fn num_set_aggregation_bits(&self) -> usize {
        self.aggregation_bits.num_set_bits()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AggregateAndProof {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: u64,
    pub aggregate: Attestation,
    pub selection_proof: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedAggregateAndProof {
    pub message: AggregateAndProof,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct IndexedAttestation {
    #[serde(with = "ssz_types::serde_utils::quoted_u64_var_list")]
    pub attesting_indices: VariableList<u64, MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttesterSlashing {
    pub attestation_1: IndexedAttestation,
    pub attestation_2: IndexedAttestation,
}

impl AttesterSlashing {
    /// The validators slashed by this object: those attesting in both of
    /// the conflicting attestations.
    pub fn offending_indices(&self) -> Vec<u64> {
        self.attestation_1
            .attesting_indices
            .iter()
            .filter(|index| self.attestation_2.attesting_indices.contains(index))
            .copied()
            .collect()
    }
}

/// A signature over a slot, used to determine whether a validator
/// aggregates for its committee.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionProof(SignatureBytes);

impl SelectionProof {
    /// The committee modulo: at most one aggregator is targeted per
    /// `target_aggregators_per_committee` members.
    pub fn modulo(committee_len: usize, spec: &ChainSpec) -> u64 {
        std::cmp::max(
            1,
            committee_len as u64 / spec.target_aggregators_per_committee,
        )
    }

    pub fn is_aggregator(&self, committee_len: usize, spec: &ChainSpec) -> bool {
        bls::hash_prefix_to_u64(&self.0.serialize()) % Self::modulo(committee_len, spec) == 0
    }

    pub fn into_signature(self) -> SignatureBytes {
        self.0
    }
}

impl From<SignatureBytes> for SelectionProof {
    fn from(signature: SignatureBytes) -> Self {
        Self(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::Encode;

    fn data(slot: u64, head: u64) -> AttestationData {
        AttestationData {
            slot: Slot::new(slot),
            index: 0,
            beacon_block_root: Hash256::repeat_byte(head as u8),
            source: Checkpoint {
                epoch: Epoch::new(0),
                root: Hash256::ZERO,
            },
            target: Checkpoint {
                epoch: Epoch::new(1),
                root: Hash256::repeat_byte(0x11),
            },
        }
    }

    #[test]
    fn vote_key_distinguishes_heads() {
        assert_eq!(data(1, 0xab).as_ssz_bytes(), data(1, 0xab).as_ssz_bytes());
        assert_ne!(data(1, 0xab).as_ssz_bytes(), data(1, 0xef).as_ssz_bytes());
    }

    #[test]
    fn empty_for_signing_sets_one_bit() {
        let attestation = Attestation::empty_for_signing(data(1, 0xab), 64, 3).unwrap();
        assert_eq!(attestation.num_set_aggregation_bits(), 1);
        assert!(attestation.aggregation_bits.get(3).unwrap());
        assert!(!attestation.aggregation_bits.get(2).unwrap());
    }

    #[test]
    fn empty_for_signing_rejects_out_of_range_position() {
        assert!(Attestation::empty_for_signing(data(1, 0xab), 4, 7).is_err());
    }

    #[test]
    fn small_committees_always_aggregate() {
        // Below the aggregator target the modulo saturates at one, so any
        // proof elects the validator.
        let spec = ChainSpec::mainnet();
        let proof = SelectionProof::from(SignatureBytes::empty());
        assert_eq!(SelectionProof::modulo(15, &spec), 1);
        assert!(proof.is_aggregator(15, &spec));
    }

    #[test]
    fn modulo_scales_with_committee() {
        let spec = ChainSpec::mainnet();
        assert_eq!(SelectionProof::modulo(512, &spec), 32);
        assert_eq!(SelectionProof::modulo(16, &spec), 1);
    }

    #[test]
    fn offending_indices_is_the_intersection() {
        let attestation = |indices: Vec<u64>| IndexedAttestation {
            attesting_indices: VariableList::new(indices).unwrap(),
            data: data(1, 0xab),
            signature: SignatureBytes::empty(),
        };
        let slashing = AttesterSlashing {
            attestation_1: attestation(vec![1, 2, 3, 7]),
            attestation_2: attestation(vec![2, 7, 9]),
        };
        assert_eq!(slashing.offending_indices(), vec![2, 7]);
    }
}
