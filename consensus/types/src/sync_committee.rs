use crate::{ChainSpec, Hash256, Slot};
use bls::{PublicKeyBytes, SignatureBytes};
use serde::{Deserialize, Serialize};
use ssz_types::typenum::U128;
use ssz_types::BitVector;
use ssz_derive::{Decode, Encode};
use tree_hash_derive::TreeHash;

/// Index of a sync subcommittee (subnet).
pub type SyncSubnetId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncCommitteeMessage {
    pub slot: Slot,
    pub beacon_block_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncCommitteeContribution {
    pub slot: Slot,
    pub beacon_block_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: u64,
    pub aggregation_bits: BitVector<U128>,
    pub signature: SignatureBytes,
}

impl SyncCommitteeContribution {
    pub fn num_set_aggregation_bits(&self) -> usize {
        self.aggregation_bits.num_set_bits()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ContributionAndProof {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: u64,
    pub contribution: SyncCommitteeContribution,
    pub selection_proof: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedContributionAndProof {
    pub message: ContributionAndProof,
    pub signature: SignatureBytes,
}

/// The object signed to determine sync-contribution aggregator election.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncAggregatorSelectionData {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: u64,
}

/// A sync duty as returned by `/eth/v1/validator/duties/sync/{epoch}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDuty {
    pub pubkey: PublicKeyBytes,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validator_sync_committee_indices: Vec<u64>,
}

impl SyncDuty {
    /// The subcommittees this validator serves in, derived from its
    /// positions in the full committee.
    pub fn subnet_ids(&self, spec: &ChainSpec) -> Vec<SyncSubnetId> {
        let subcommittee_size = spec.sync_committee_size / spec.sync_committee_subnet_count;
        let mut subnets: Vec<SyncSubnetId> = self
            .validator_sync_committee_indices
            .iter()
            .map(|index| index / subcommittee_size)
            .collect();
        subnets.sort_unstable();
        subnets.dedup();
        subnets
    }
}

/// A signature over `SyncAggregatorSelectionData`, used to determine
/// whether a validator aggregates for a sync subcommittee.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSelectionProof(SignatureBytes);

impl SyncSelectionProof {
    pub fn modulo(spec: &ChainSpec) -> u64 {
        std::cmp::max(
            1,
            spec.sync_committee_size
                / spec.sync_committee_subnet_count
                / spec.target_aggregators_per_sync_subcommittee,
        )
    }

    pub fn is_aggregator(&self, spec: &ChainSpec) -> bool {
        bls::hash_prefix_to_u64(&self.0.serialize()) % Self::modulo(spec) == 0
    }

    pub fn into_signature(self) -> SignatureBytes {
        self.0
    }
}

impl From<SignatureBytes> for SyncSelectionProof {
    fn from(signature: SignatureBytes) -> Self {
        Self(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_ids_derived_from_committee_positions() {
        let spec = ChainSpec::mainnet();
        let duty = SyncDuty {
            pubkey: PublicKeyBytes::empty(),
            validator_index: 1,
            // Subcommittee size is 512 / 4 = 128.
            validator_sync_committee_indices: vec![0, 127, 128, 300, 511],
        };
        assert_eq!(duty.subnet_ids(&spec), vec![0, 1, 2, 3]);
    }

    #[test]
    fn sync_modulo_mainnet() {
        // 512 / 4 / 16 = 8.
        assert_eq!(SyncSelectionProof::modulo(&ChainSpec::mainnet()), 8);
    }
}
