//! The consensus containers and network constants this client consumes.
//!
//! Only the subset of the consensus data model a validator client touches
//! is defined here. Containers carry SSZ, tree-hash and Beacon-API-JSON
//! impls; anything requiring private-key material lives behind the remote
//! signer instead.

mod attestation;
mod beacon_block;
mod chain_spec;
mod graffiti;
mod slot_epoch;
mod sync_committee;
mod validator;

pub use attestation::{
    AggregateAndProof, Attestation, AttestationData, AttesterSlashing, Checkpoint,
    CommitteeIndex, IndexedAttestation, MaxValidatorsPerCommittee, SelectionProof,
    SignedAggregateAndProof,
};
pub use beacon_block::{
    Address, BeaconBlock, BeaconBlockBody, BeaconBlockHeader, BlindedBeaconBlock,
    BlindedBeaconBlockBody, Blob, BlobsList, BlockContents, BlsToExecutionChange, Deposit,
    DepositData, Eth1Data, ExecutionPayload, ExecutionPayloadHeader, KzgCommitment,
    KzgCommitments, KzgProof, KzgProofs, ProposerSlashing, SignedBeaconBlock,
    SignedBeaconBlockHeader, SignedBlindedBeaconBlock, SignedBlockContents,
    SignedBlsToExecutionChange, SyncAggregate, Transaction, Transactions, Withdrawal,
};
pub use bls::{PublicKeyBytes, SignatureBytes};
pub use chain_spec::{ChainSpec, Fork, ForkVersion};
pub use graffiti::{Graffiti, GraffitiString, GRAFFITI_BYTES_LEN};
pub use slot_epoch::{Epoch, Slot};
pub use sync_committee::{
    ContributionAndProof, SignedContributionAndProof, SyncAggregatorSelectionData,
    SyncCommitteeContribution, SyncCommitteeMessage, SyncDuty, SyncSelectionProof, SyncSubnetId,
};
pub use validator::{
    SignedValidatorRegistrationData, SignedVoluntaryExit, Validator, ValidatorRegistrationData,
    VoluntaryExit,
};

pub type Hash256 = alloy_primitives::B256;
pub type Uint256 = alloy_primitives::U256;
