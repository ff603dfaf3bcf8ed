//! The concrete [`ValidatorStore`] backed by the remote signer.
//!
//! This is the choke point for everything slashable. Before any signing
//! request leaves the process it must pass, in order: the slashing latch,
//! doppelganger protection, and the duty-idempotence ledger that enforces
//! at most one signing request per `(validator, slot, role)`.

use doppelganger_service::DoppelgangerService;
use parking_lot::Mutex;
use signing_method::{ForkInfo, RemoteSigner, Web3SignerObject};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use types::{
    Address, Attestation, AggregateAndProof, BeaconBlockHeader, ChainSpec, ContributionAndProof,
    Epoch, Graffiti, Hash256, PublicKeyBytes, SelectionProof, SignatureBytes,
    SignedAggregateAndProof, SignedContributionAndProof, SignedValidatorRegistrationData,
    SignedVoluntaryExit, Slot, SyncAggregatorSelectionData, SyncCommitteeContribution,
    SyncCommitteeMessage, SyncSelectionProof, SyncSubnetId, ValidatorRegistrationData,
    VoluntaryExit,
};
use validator_registry::ValidatorRegistry;
use validator_store::{
    DoppelgangerStatus, Error, ProposalData, SigningRole, SlashingLatch, ValidatorStore,
};

/// The gas limit applied when neither the validator nor the process
/// configures one.
pub const DEFAULT_GAS_LIMIT: u64 = 30_000_000;

/// Ledger entries older than this many epochs are dropped; a duty that old
/// can no longer be re-fired by any executor.
const LEDGER_RETENTION_EPOCHS: u64 = 2;

pub struct Config {
    pub default_fee_recipient: Option<Address>,
    pub default_gas_limit: Option<u64>,
    pub default_graffiti: Option<Graffiti>,
    pub use_external_builder: bool,
    pub builder_boost_factor: u64,
}

pub struct VeroValidatorStore {
    registry: Arc<ValidatorRegistry>,
    signer: Arc<RemoteSigner>,
    doppelganger_service: Option<Arc<DoppelgangerService>>,
    slashing_latch: SlashingLatch,
    spec: Arc<ChainSpec>,
    genesis_validators_root: Hash256,
    config: Config,
    signing_ledger: Mutex<HashSet<(PublicKeyBytes, Slot, SigningRole)>>,
}

impl VeroValidatorStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ValidatorRegistry>,
        signer: Arc<RemoteSigner>,
        doppelganger_service: Option<Arc<DoppelgangerService>>,
        slashing_latch: SlashingLatch,
        spec: Arc<ChainSpec>,
        genesis_validators_root: Hash256,
        config: Config,
    ) -> Self {
        Self {
            registry,
            signer,
            doppelganger_service,
            slashing_latch,
            spec,
            genesis_validators_root,
            config,
            signing_ledger: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    fn fork_info(&self, epoch: Epoch) -> ForkInfo {
        RemoteSigner::fork_info(self.spec.fork_at_epoch(epoch), self.genesis_validators_root)
    }

    /// The shared precondition for every slashable signature: latch,
    /// doppelganger, then the idempotence ledger. Recording in the ledger
    /// happens *before* the signing request is issued, so even a crash
    /// mid-request cannot lead to a second request for the same duty.
    fn allow_slashable_signing(
        &self,
        pubkey: PublicKeyBytes,
        slot: Slot,
        role: SigningRole,
    ) -> Result<(), Error> {
        if self.slashing_latch.is_set() {
            return Err(Error::SlashingDetected);
        }
        if !self.doppelganger_protection_allows_signing(pubkey) {
            return Err(Error::DoppelgangerProtected(pubkey));
        }
        if self.registry.record(&pubkey).is_none() {
            return Err(Error::UnknownPubkey(pubkey));
        }
        let newly_inserted = self.signing_ledger.lock().insert((pubkey, slot, role));
        if !newly_inserted {
            return Err(Error::DutyAlreadyPerformed { pubkey, slot, role });
        }
        Ok(())
    }

    /// Preconditions for non-slashable signatures (randao, selection
    /// proofs, registrations): the latch still applies, idempotence does
    /// not.
    fn allow_auxiliary_signing(&self, pubkey: PublicKeyBytes) -> Result<(), Error> {
        if self.slashing_latch.is_set() {
            return Err(Error::SlashingDetected);
        }
        if self.registry.record(&pubkey).is_none() {
            return Err(Error::UnknownPubkey(pubkey));
        }
        Ok(())
    }

    fn gas_limit(&self, pubkey: &PublicKeyBytes) -> u64 {
        self.registry
            .record(pubkey)
            .and_then(|record| record.gas_limit)
            .or(self.config.default_gas_limit)
            .unwrap_or(DEFAULT_GAS_LIMIT)
    }

    /// The boost factor passed to block production. Builder disabled
    /// forces local payloads; a factor of 100 is the beacon node default
    /// and is elided.
    fn builder_boost_factor(&self) -> Option<u64> {
        if !self.config.use_external_builder {
            return Some(0);
        }
        if self.config.builder_boost_factor == 100 {
            None
        } else {
            Some(self.config.builder_boost_factor)
        }
    }
}

impl ValidatorStore for VeroValidatorStore {
    fn validator_index(&self, pubkey: &PublicKeyBytes) -> Option<u64> {
        self.registry.index_of(pubkey)
    }

    fn voting_pubkeys<I, F>(&self, filter_func: F) -> I
    where
        I: FromIterator<PublicKeyBytes>,
        F: Fn(DoppelgangerStatus) -> Option<PublicKeyBytes>,
    {
        self.registry
            .pubkeys()
            .into_iter()
            .filter_map(|pubkey| {
                let status = match &self.doppelganger_service {
                    Some(service) => service.validator_status(pubkey),
                    // Doppelganger detection disabled: all keys may sign.
                    None => DoppelgangerStatus::SigningEnabled(pubkey),
                };
                filter_func(status)
            })
            .collect()
    }

    fn doppelganger_protection_allows_signing(&self, validator_pubkey: PublicKeyBytes) -> bool {
        match &self.doppelganger_service {
            Some(service) => matches!(
                service.validator_status(validator_pubkey),
                DoppelgangerStatus::SigningEnabled(_)
            ),
            None => true,
        }
    }

    fn num_voting_validators(&self) -> usize {
        self.registry.num_validators()
    }

    fn slashing_latch(&self) -> &SlashingLatch {
        &self.slashing_latch
    }

    fn graffiti(&self, validator_pubkey: &PublicKeyBytes) -> Option<Graffiti> {
        self.registry
            .record(validator_pubkey)
            .and_then(|record| record.graffiti)
            .or(self.config.default_graffiti)
    }

    fn get_fee_recipient(&self, validator_pubkey: &PublicKeyBytes) -> Option<Address> {
        self.registry
            .record(validator_pubkey)
            .and_then(|record| record.fee_recipient)
            .or(self.config.default_fee_recipient)
    }

    async fn randao_reveal(
        &self,
        validator_pubkey: PublicKeyBytes,
        signing_epoch: Epoch,
    ) -> Result<SignatureBytes, Error> {
        self.allow_auxiliary_signing(validator_pubkey)?;
        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::RandaoReveal {
                    randao_reveal: signing_method::RandaoReveal {
                        epoch: signing_epoch,
                    },
                },
                Some(self.fork_info(signing_epoch)),
            )
            .await?;
        Ok(signature)
    }

    async fn sign_block(
        &self,
        validator_pubkey: PublicKeyBytes,
        block_header: BeaconBlockHeader,
        current_slot: Slot,
    ) -> Result<SignatureBytes, Error> {
        // A block from a future slot could be used against us later;
        // refuse outright.
        if block_header.slot > current_slot {
            return Err(Error::GreaterThanCurrentSlot {
                slot: block_header.slot,
                current_slot,
            });
        }

        self.allow_slashable_signing(validator_pubkey, block_header.slot, SigningRole::Block)?;

        let epoch = block_header.slot.epoch(self.spec.slots_per_epoch);
        let version = self.spec.fork_name_at_epoch(epoch).to_uppercase();
        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::BeaconBlock {
                    beacon_block: signing_method::BlockRequest {
                        version,
                        block_header,
                    },
                },
                Some(self.fork_info(epoch)),
            )
            .await?;
        Ok(signature)
    }

    async fn sign_attestation(
        &self,
        validator_pubkey: PublicKeyBytes,
        validator_committee_position: usize,
        attestation: &mut Attestation,
        current_epoch: Epoch,
    ) -> Result<(), Error> {
        // Checking for slashing conditions is the signer's job; the
        // target-epoch guard merely refuses obviously-bogus data.
        if attestation.data.target.epoch > current_epoch {
            return Err(Error::GreaterThanCurrentEpoch {
                epoch: attestation.data.target.epoch,
                current_epoch,
            });
        }

        if attestation
            .aggregation_bits
            .get(validator_committee_position)
            != Ok(true)
        {
            warn!(
                pubkey = ?validator_pubkey,
                position = validator_committee_position,
                "Attestation participation bit not set before signing"
            );
        }

        self.allow_slashable_signing(
            validator_pubkey,
            attestation.data.slot,
            SigningRole::Attestation,
        )?;

        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::Attestation {
                    attestation: &attestation.data,
                },
                Some(self.fork_info(attestation.data.target.epoch)),
            )
            .await?;
        attestation.signature = signature;
        Ok(())
    }

    async fn produce_signed_aggregate_and_proof(
        &self,
        validator_pubkey: PublicKeyBytes,
        aggregator_index: u64,
        aggregate: Attestation,
        selection_proof: SelectionProof,
    ) -> Result<SignedAggregateAndProof, Error> {
        let slot = aggregate.data.slot;
        self.allow_slashable_signing(validator_pubkey, slot, SigningRole::Aggregate)?;

        let target_epoch = aggregate.data.target.epoch;
        let message = AggregateAndProof {
            aggregator_index,
            aggregate,
            selection_proof: selection_proof.into_signature(),
        };
        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::AggregateAndProof {
                    aggregate_and_proof: &message,
                },
                Some(self.fork_info(target_epoch)),
            )
            .await?;
        Ok(SignedAggregateAndProof { message, signature })
    }

    async fn produce_selection_proof(
        &self,
        validator_pubkey: PublicKeyBytes,
        slot: Slot,
    ) -> Result<SelectionProof, Error> {
        self.allow_auxiliary_signing(validator_pubkey)?;
        let epoch = slot.epoch(self.spec.slots_per_epoch);
        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::AggregationSlot {
                    aggregation_slot: signing_method::AggregationSlot { slot },
                },
                Some(self.fork_info(epoch)),
            )
            .await?;
        Ok(SelectionProof::from(signature))
    }

    async fn produce_sync_selection_proof(
        &self,
        validator_pubkey: &PublicKeyBytes,
        slot: Slot,
        subnet_id: SyncSubnetId,
    ) -> Result<SyncSelectionProof, Error> {
        self.allow_auxiliary_signing(*validator_pubkey)?;
        let epoch = slot.epoch(self.spec.slots_per_epoch);
        let selection_data = SyncAggregatorSelectionData {
            slot,
            subcommittee_index: subnet_id,
        };
        let signature = self
            .signer
            .sign(
                validator_pubkey,
                Web3SignerObject::SyncCommitteeSelectionProof {
                    sync_aggregator_selection_data: &selection_data,
                },
                Some(self.fork_info(epoch)),
            )
            .await?;
        Ok(SyncSelectionProof::from(signature))
    }

    async fn produce_sync_committee_signature(
        &self,
        slot: Slot,
        beacon_block_root: Hash256,
        validator_index: u64,
        validator_pubkey: &PublicKeyBytes,
    ) -> Result<SyncCommitteeMessage, Error> {
        self.allow_slashable_signing(*validator_pubkey, slot, SigningRole::SyncCommitteeMessage)?;
        let epoch = slot.epoch(self.spec.slots_per_epoch);
        let signature = self
            .signer
            .sign(
                validator_pubkey,
                Web3SignerObject::SyncCommitteeMessage {
                    sync_committee_message: signing_method::SyncCommitteeMessageData {
                        beacon_block_root,
                        slot,
                    },
                },
                Some(self.fork_info(epoch)),
            )
            .await?;
        Ok(SyncCommitteeMessage {
            slot,
            beacon_block_root,
            validator_index,
            signature,
        })
    }

    async fn produce_signed_contribution_and_proof(
        &self,
        aggregator_index: u64,
        aggregator_pubkey: PublicKeyBytes,
        contribution: SyncCommitteeContribution,
        selection_proof: SyncSelectionProof,
    ) -> Result<SignedContributionAndProof, Error> {
        let slot = contribution.slot;
        self.allow_slashable_signing(
            aggregator_pubkey,
            slot,
            SigningRole::SyncCommitteeContribution,
        )?;

        let epoch = slot.epoch(self.spec.slots_per_epoch);
        let message = ContributionAndProof {
            aggregator_index,
            contribution,
            selection_proof: selection_proof.into_signature(),
        };
        let signature = self
            .signer
            .sign(
                &aggregator_pubkey,
                Web3SignerObject::ContributionAndProof {
                    contribution_and_proof: &message,
                },
                Some(self.fork_info(epoch)),
            )
            .await?;
        Ok(SignedContributionAndProof { message, signature })
    }

    async fn sign_validator_registration_data(
        &self,
        validator_registration_data: ValidatorRegistrationData,
    ) -> Result<SignedValidatorRegistrationData, Error> {
        let pubkey = validator_registration_data.pubkey;
        self.allow_auxiliary_signing(pubkey)?;
        // Registrations sign under the application-level builder domain;
        // no fork info is attached.
        let signature = self
            .signer
            .sign(
                &pubkey,
                Web3SignerObject::ValidatorRegistration {
                    validator_registration: &validator_registration_data,
                },
                None,
            )
            .await?;
        Ok(SignedValidatorRegistrationData {
            message: validator_registration_data,
            signature,
        })
    }

    async fn sign_voluntary_exit(
        &self,
        validator_pubkey: PublicKeyBytes,
        voluntary_exit: VoluntaryExit,
    ) -> Result<SignedVoluntaryExit, Error> {
        self.allow_auxiliary_signing(validator_pubkey)?;
        let signature = self
            .signer
            .sign(
                &validator_pubkey,
                Web3SignerObject::VoluntaryExit {
                    voluntary_exit: &voluntary_exit,
                },
                Some(self.fork_info(voluntary_exit.epoch)),
            )
            .await?;
        Ok(SignedVoluntaryExit {
            message: voluntary_exit,
            signature,
        })
    }

    fn proposal_data(&self, pubkey: &PublicKeyBytes) -> Option<ProposalData> {
        let record = self.registry.record(pubkey)?;
        Some(ProposalData {
            validator_index: record.index,
            fee_recipient: record
                .fee_recipient
                .or(self.config.default_fee_recipient),
            gas_limit: self.gas_limit(pubkey),
            builder_boost_factor: self.builder_boost_factor(),
        })
    }

    fn prune_signing_ledger(&self, current_epoch: Epoch) {
        let cutoff = current_epoch
            .saturating_sub(LEDGER_RETENTION_EPOCHS)
            .start_slot(self.spec.slots_per_epoch);
        self.signing_ledger
            .lock()
            .retain(|(_, slot, _)| *slot >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    fn pubkey(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes::deserialize(&[byte; 48]).unwrap()
    }

    fn store(latch: SlashingLatch) -> VeroValidatorStore {
        let spec = Arc::new(ChainSpec::mainnet());
        let registry = Arc::new(ValidatorRegistry::new(vec![pubkey(1)]));
        let signer = Arc::new(RemoteSigner::new(
            sensitive_url::SensitiveUrl::from_str("http://localhost:9000").unwrap(),
            Duration::from_secs(1),
        ));
        VeroValidatorStore::new(
            registry,
            signer,
            None,
            latch,
            spec,
            Hash256::ZERO,
            Config {
                default_fee_recipient: None,
                default_gas_limit: None,
                default_graffiti: None,
                use_external_builder: false,
                builder_boost_factor: 100,
            },
        )
    }

    #[test]
    fn ledger_enforces_one_request_per_duty() {
        let store = store(SlashingLatch::new());
        let slot = Slot::new(100);
        assert!(store
            .allow_slashable_signing(pubkey(1), slot, SigningRole::Attestation)
            .is_ok());
        assert_eq!(
            store.allow_slashable_signing(pubkey(1), slot, SigningRole::Attestation),
            Err(Error::DutyAlreadyPerformed {
                pubkey: pubkey(1),
                slot,
                role: SigningRole::Attestation,
            })
        );
        // A different role for the same slot is a different duty.
        assert!(store
            .allow_slashable_signing(pubkey(1), slot, SigningRole::Aggregate)
            .is_ok());
        // The next slot is a fresh duty.
        assert!(store
            .allow_slashable_signing(pubkey(1), slot + 1u64, SigningRole::Attestation)
            .is_ok());
    }

    #[test]
    fn latch_blocks_all_signing() {
        let latch = SlashingLatch::new();
        let store = store(latch.clone());
        latch.set();
        assert_eq!(
            store.allow_slashable_signing(pubkey(1), Slot::new(1), SigningRole::Block),
            Err(Error::SlashingDetected)
        );
        assert_eq!(
            store.allow_auxiliary_signing(pubkey(1)),
            Err(Error::SlashingDetected)
        );
    }

    #[test]
    fn unknown_pubkeys_are_rejected() {
        let store = store(SlashingLatch::new());
        assert_eq!(
            store.allow_slashable_signing(pubkey(9), Slot::new(1), SigningRole::Block),
            Err(Error::UnknownPubkey(pubkey(9)))
        );
    }

    #[test]
    fn ledger_pruning_retains_recent_duties() {
        let store = store(SlashingLatch::new());
        let old_slot = Slot::new(0);
        let recent_slot = Slot::new(320);
        store
            .allow_slashable_signing(pubkey(1), old_slot, SigningRole::Attestation)
            .unwrap();
        store
            .allow_slashable_signing(pubkey(1), recent_slot, SigningRole::Attestation)
            .unwrap();

        store.prune_signing_ledger(Epoch::new(10));

        // The pruned entry may be re-inserted; the recent one may not.
        assert!(store
            .allow_slashable_signing(pubkey(1), old_slot, SigningRole::Attestation)
            .is_ok());
        assert!(store
            .allow_slashable_signing(pubkey(1), recent_slot, SigningRole::Attestation)
            .is_err());
    }

    #[test]
    fn builder_boost_factor_resolution() {
        let mut store = store(SlashingLatch::new());
        assert_eq!(store.builder_boost_factor(), Some(0), "builder disabled");
        store.config.use_external_builder = true;
        assert_eq!(store.builder_boost_factor(), None, "100 is the default");
        store.config.builder_boost_factor = 90;
        assert_eq!(store.builder_boost_factor(), Some(90));
    }
}
