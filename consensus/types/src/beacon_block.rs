use crate::{
    Attestation, AttesterSlashing, Graffiti, Hash256, SignedVoluntaryExit, Slot, Uint256,
};
use bls::{PublicKeyBytes, SignatureBytes};
use serde::{Deserialize, Serialize};
use ssz_types::typenum::{U1048576, U1073741824, U128, U131072, U16, U2, U256, U32, U33, U4096, U512};
use ssz_types::{BitVector, FixedVector, VariableList};
use ssz_derive::{Decode, Encode};
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

pub type Address = alloy_primitives::Address;

bls::bytes_struct!(KzgCommitment, 48, "A KZG commitment to a blob.");
bls::bytes_struct!(KzgProof, 48, "A KZG proof for a blob.");

pub type Transaction = VariableList<u8, U1073741824>;
pub type Transactions = VariableList<Transaction, U1048576>;
pub type Blob = VariableList<u8, U131072>;
pub type BlobsList = VariableList<Blob, U4096>;
pub type KzgProofs = VariableList<KzgProof, U4096>;
pub type KzgCommitments = VariableList<KzgCommitment, U4096>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Eth1Data {
    pub deposit_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub deposit_count: u64,
    pub block_hash: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

impl ProposerSlashing {
    pub fn offending_index(&self) -> u64 {
        self.signed_header_1.message.proposer_index
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct DepositData {
    pub pubkey: PublicKeyBytes,
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Deposit {
    pub proof: FixedVector<Hash256, U33>,
    pub data: DepositData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncAggregate {
    pub sync_committee_bits: BitVector<U512>,
    pub sync_committee_signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Withdrawal {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub address: Address,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BlsToExecutionChange {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub from_bls_pubkey: PublicKeyBytes,
    pub to_execution_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBlsToExecutionChange {
    pub message: BlsToExecutionChange,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ExecutionPayload {
    pub parent_hash: Hash256,
    pub fee_recipient: Address,
    pub state_root: Hash256,
    pub receipts_root: Hash256,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub logs_bloom: FixedVector<u8, U256>,
    pub prev_randao: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    #[serde(with = "ssz_types::serde_utils::hex_var_list")]
    pub extra_data: VariableList<u8, U32>,
    #[serde(with = "serde_utils::quoted_u256")]
    pub base_fee_per_gas: Uint256,
    pub block_hash: Hash256,
    #[serde(with = "ssz_types::serde_utils::list_of_hex_var_list")]
    pub transactions: Transactions,
    pub withdrawals: VariableList<Withdrawal, U16>,
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

/// The commitment to an execution payload inside an externally-built
/// (blinded) block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ExecutionPayloadHeader {
    pub parent_hash: Hash256,
    pub fee_recipient: Address,
    pub state_root: Hash256,
    pub receipts_root: Hash256,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub logs_bloom: FixedVector<u8, U256>,
    pub prev_randao: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    #[serde(with = "ssz_types::serde_utils::hex_var_list")]
    pub extra_data: VariableList<u8, U32>,
    #[serde(with = "serde_utils::quoted_u256")]
    pub base_fee_per_gas: Uint256,
    pub block_hash: Hash256,
    pub transactions_root: Hash256,
    pub withdrawals_root: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

macro_rules! block_body_struct {
    ($body:ident, $payload_field:ident, $payload:ty) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
        pub struct $body {
            pub randao_reveal: SignatureBytes,
            pub eth1_data: Eth1Data,
            pub graffiti: Graffiti,
            pub proposer_slashings: VariableList<ProposerSlashing, U16>,
            pub attester_slashings: VariableList<AttesterSlashing, U2>,
            pub attestations: VariableList<Attestation, U128>,
            pub deposits: VariableList<Deposit, U16>,
            pub voluntary_exits: VariableList<SignedVoluntaryExit, U16>,
            pub sync_aggregate: SyncAggregate,
            pub $payload_field: $payload,
            pub bls_to_execution_changes: VariableList<SignedBlsToExecutionChange, U16>,
            pub blob_kzg_commitments: KzgCommitments,
        }
    };
}

block_body_struct!(BeaconBlockBody, execution_payload, ExecutionPayload);
block_body_struct!(
    BlindedBeaconBlockBody,
    execution_payload_header,
    ExecutionPayloadHeader
);

macro_rules! block_struct {
    ($block:ident, $signed:ident, $body:ty) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
        pub struct $block {
            pub slot: Slot,
            #[serde(with = "serde_utils::quoted_u64")]
            pub proposer_index: u64,
            pub parent_root: Hash256,
            pub state_root: Hash256,
            pub body: $body,
        }

        impl $block {
            /// The header committed to by the block signature. Computing
            /// the body root here is what lets the remote signer verify a
            /// block without receiving its full body.
            pub fn block_header(&self) -> BeaconBlockHeader {
                BeaconBlockHeader {
                    slot: self.slot,
                    proposer_index: self.proposer_index,
                    parent_root: self.parent_root,
                    state_root: self.state_root,
                    body_root: self.body.tree_hash_root(),
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
        pub struct $signed {
            pub message: $block,
            pub signature: SignatureBytes,
        }
    };
}

block_struct!(BeaconBlock, SignedBeaconBlock, BeaconBlockBody);
block_struct!(
    BlindedBeaconBlock,
    SignedBlindedBeaconBlock,
    BlindedBeaconBlockBody
);

/// A locally-built block as returned by the produce-block API: the block
/// itself plus the blob sidecar material that must be republished with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockContents {
    pub block: BeaconBlock,
    pub kzg_proofs: KzgProofs,
    #[serde(with = "ssz_types::serde_utils::list_of_hex_var_list")]
    pub blobs: BlobsList,
}

/// The body posted to `/eth/v2/beacon/blocks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode)]
pub struct SignedBlockContents {
    pub signed_block: SignedBeaconBlock,
    pub kzg_proofs: KzgProofs,
    #[serde(with = "ssz_types::serde_utils::list_of_hex_var_list")]
    pub blobs: BlobsList,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_body_root_tracks_body_changes() {
        let mut block = BeaconBlock {
            slot: Slot::new(100),
            proposer_index: 7,
            parent_root: Hash256::repeat_byte(1),
            state_root: Hash256::repeat_byte(2),
            body: BeaconBlockBody {
                randao_reveal: SignatureBytes::empty(),
                eth1_data: Eth1Data {
                    deposit_root: Hash256::ZERO,
                    deposit_count: 0,
                    block_hash: Hash256::ZERO,
                },
                graffiti: Graffiti::default(),
                proposer_slashings: VariableList::empty(),
                attester_slashings: VariableList::empty(),
                attestations: VariableList::empty(),
                deposits: VariableList::empty(),
                voluntary_exits: VariableList::empty(),
                sync_aggregate: SyncAggregate {
                    sync_committee_bits: BitVector::new(),
                    sync_committee_signature: SignatureBytes::empty(),
                },
                execution_payload: ExecutionPayload {
                    parent_hash: Hash256::ZERO,
                    fee_recipient: Address::ZERO,
                    state_root: Hash256::ZERO,
                    receipts_root: Hash256::ZERO,
                    logs_bloom: FixedVector::default(),
                    prev_randao: Hash256::ZERO,
                    block_number: 0,
                    gas_limit: 0,
                    gas_used: 0,
                    timestamp: 0,
                    extra_data: VariableList::empty(),
                    base_fee_per_gas: Uint256::ZERO,
                    block_hash: Hash256::ZERO,
                    transactions: VariableList::empty(),
                    withdrawals: VariableList::empty(),
                    blob_gas_used: 0,
                    excess_blob_gas: 0,
                },
                bls_to_execution_changes: VariableList::empty(),
                blob_kzg_commitments: VariableList::empty(),
            },
        };

        let header = block.block_header();
        assert_eq!(header.slot, block.slot);
        assert_eq!(header.proposer_index, 7);

        block.body.graffiti = Graffiti([1; 32]);
        assert_ne!(block.block_header().body_root, header.body_root);
    }
}
