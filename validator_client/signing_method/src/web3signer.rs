//! Request shapes for the standard remote signing API.

use serde::Serialize;
use types::{
    AggregateAndProof, AttestationData, BeaconBlockHeader, ContributionAndProof, Epoch, Fork,
    Hash256, Slot, SyncAggregatorSelectionData, ValidatorRegistrationData, VoluntaryExit,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForkInfo {
    pub fork: Fork,
    pub genesis_validators_root: Hash256,
}

#[derive(Serialize)]
pub struct AggregationSlot {
    pub slot: Slot,
}

#[derive(Serialize)]
pub struct RandaoReveal {
    pub epoch: Epoch,
}

#[derive(Serialize)]
pub struct SyncCommitteeMessageData {
    pub beacon_block_root: Hash256,
    pub slot: Slot,
}

/// The `BLOCK_V2` payload: the signer verifies a header, not the full
/// block body.
#[derive(Serialize)]
pub struct BlockRequest {
    /// Uppercase fork name, e.g. `DENEB`.
    pub version: String,
    pub block_header: BeaconBlockHeader,
}

/// A discriminated signing payload. The `type` tag selects the signing
/// domain on the signer side.
#[derive(Serialize)]
#[serde(tag = "type")]
pub enum Web3SignerObject<'a> {
    #[serde(rename = "AGGREGATE_AND_PROOF")]
    AggregateAndProof {
        aggregate_and_proof: &'a AggregateAndProof,
    },
    #[serde(rename = "AGGREGATION_SLOT")]
    AggregationSlot { aggregation_slot: AggregationSlot },
    #[serde(rename = "ATTESTATION")]
    Attestation { attestation: &'a AttestationData },
    #[serde(rename = "BLOCK_V2")]
    BeaconBlock { beacon_block: BlockRequest },
    #[serde(rename = "RANDAO_REVEAL")]
    RandaoReveal { randao_reveal: RandaoReveal },
    #[serde(rename = "SYNC_COMMITTEE_MESSAGE")]
    SyncCommitteeMessage {
        sync_committee_message: SyncCommitteeMessageData,
    },
    #[serde(rename = "SYNC_COMMITTEE_SELECTION_PROOF")]
    SyncCommitteeSelectionProof {
        sync_aggregator_selection_data: &'a SyncAggregatorSelectionData,
    },
    #[serde(rename = "SYNC_COMMITTEE_CONTRIBUTION_AND_PROOF")]
    ContributionAndProof {
        contribution_and_proof: &'a ContributionAndProof,
    },
    #[serde(rename = "VALIDATOR_REGISTRATION")]
    ValidatorRegistration {
        validator_registration: &'a ValidatorRegistrationData,
    },
    #[serde(rename = "VOLUNTARY_EXIT")]
    VoluntaryExit { voluntary_exit: &'a VoluntaryExit },
}

impl Web3SignerObject<'_> {
    /// A short label for logs and metrics.
    pub fn message_kind(&self) -> &'static str {
        match self {
            Web3SignerObject::AggregateAndProof { .. } => "aggregate_and_proof",
            Web3SignerObject::AggregationSlot { .. } => "aggregation_slot",
            Web3SignerObject::Attestation { .. } => "attestation",
            Web3SignerObject::BeaconBlock { .. } => "block",
            Web3SignerObject::RandaoReveal { .. } => "randao_reveal",
            Web3SignerObject::SyncCommitteeMessage { .. } => "sync_committee_message",
            Web3SignerObject::SyncCommitteeSelectionProof { .. } => "sync_selection_proof",
            Web3SignerObject::ContributionAndProof { .. } => "contribution_and_proof",
            Web3SignerObject::ValidatorRegistration { .. } => "validator_registration",
            Web3SignerObject::VoluntaryExit { .. } => "voluntary_exit",
        }
    }
}

#[derive(Serialize)]
pub struct SigningRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_info: Option<ForkInfo>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "signingRoot")]
    pub signing_root: Option<Hash256>,
    #[serde(flatten)]
    pub object: Web3SignerObject<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestation_request_shape() {
        let data = AttestationData {
            slot: Slot::new(10),
            index: 2,
            beacon_block_root: Hash256::repeat_byte(0xab),
            source: types::Checkpoint {
                epoch: Epoch::new(0),
                root: Hash256::ZERO,
            },
            target: types::Checkpoint {
                epoch: Epoch::new(1),
                root: Hash256::ZERO,
            },
        };
        let request = SigningRequest {
            fork_info: None,
            signing_root: None,
            object: Web3SignerObject::Attestation { attestation: &data },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "ATTESTATION");
        assert_eq!(json["attestation"]["slot"], "10");
        assert!(json.get("fork_info").is_none());
    }

    #[test]
    fn randao_request_carries_epoch_only() {
        let request = SigningRequest {
            fork_info: None,
            signing_root: None,
            object: Web3SignerObject::RandaoReveal {
                randao_reveal: RandaoReveal {
                    epoch: Epoch::new(7),
                },
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "RANDAO_REVEAL");
        assert_eq!(json["randao_reveal"]["epoch"], "7");
    }
}
