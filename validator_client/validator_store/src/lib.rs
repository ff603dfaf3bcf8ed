use signing_method::Error as SigningError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use types::{
    Address, AttestationData, Attestation, BeaconBlockHeader, Epoch, Graffiti, PublicKeyBytes,
    SelectionProof, SignatureBytes, SignedAggregateAndProof, SignedContributionAndProof,
    SignedValidatorRegistrationData, SignedVoluntaryExit, Slot, SyncCommitteeContribution,
    SyncCommitteeMessage, SyncSelectionProof, SyncSubnetId, ValidatorRegistrationData,
    VoluntaryExit,
};

#[derive(Debug, PartialEq)]
pub enum Error {
    DoppelgangerProtected(PublicKeyBytes),
    UnknownToDoppelgangerService(PublicKeyBytes),
    UnknownPubkey(PublicKeyBytes),
    /// The slashing latch is set; no further signatures may be produced.
    SlashingDetected,
    /// A signature for this `(validator, slot, role)` was already requested.
    DutyAlreadyPerformed {
        pubkey: PublicKeyBytes,
        slot: Slot,
        role: SigningRole,
    },
    GreaterThanCurrentSlot {
        slot: Slot,
        current_slot: Slot,
    },
    GreaterThanCurrentEpoch {
        epoch: Epoch,
        current_epoch: Epoch,
    },
    UnableToSign(SigningError),
}

impl From<SigningError> for Error {
    fn from(e: SigningError) -> Self {
        Error::UnableToSign(e)
    }
}

/// The slashable duty classes, used to enforce at-most-one signing request
/// per `(validator, slot, role)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningRole {
    Block,
    Attestation,
    Aggregate,
    SyncCommitteeMessage,
    SyncCommitteeContribution,
}

impl SigningRole {
    /// The label used for per-duty submission metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningRole::Block => "block",
            SigningRole::Attestation => "attestation",
            SigningRole::Aggregate => "aggregate",
            SigningRole::SyncCommitteeMessage => "sync_committee_message",
            SigningRole::SyncCommitteeContribution => "sync_committee_contribution",
        }
    }
}

impl fmt::Display for SigningRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The process-wide safety latch.
///
/// Once set it is never cleared: every duty executor checks it immediately
/// before requesting a signature, and the concrete store checks it again at
/// the signing boundary. The check must stay wait-free; it sits on the
/// signing fast path of every executor.
#[derive(Clone, Default)]
pub struct SlashingLatch(Arc<AtomicBool>);

impl SlashingLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the latch. Returns `true` the first time only, so callers can
    /// log/alert exactly once.
    pub fn set(&self) -> bool {
        let newly_set = !self.0.swap(true, Ordering::SeqCst);
        if newly_set {
            metrics::set_gauge(&validator_metrics::SLASHING_DETECTED, 1);
        }
        newly_set
    }
}

/// A helper struct, used for passing data from the validator store to services.
pub struct ProposalData {
    pub validator_index: Option<u64>,
    pub fee_recipient: Option<Address>,
    pub gas_limit: u64,
    pub builder_boost_factor: Option<u64>,
}

pub trait ValidatorStore: Send + Sync {
    /// Attempts to resolve the pubkey to a validator index.
    ///
    /// It may return `None` if the `pubkey` is:
    ///
    /// - Unknown.
    /// - Known, but with an unknown index.
    fn validator_index(&self, pubkey: &PublicKeyBytes) -> Option<u64>;

    /// Returns all voting pubkeys for all enabled validators.
    ///
    /// The `filter_func` allows for filtering pubkeys based upon their
    /// `DoppelgangerStatus`. There are two primary functions used here:
    ///
    /// - `DoppelgangerStatus::only_safe`: only returns pubkeys which have
    ///   passed doppelganger protection and are safe-enough to sign messages.
    /// - `DoppelgangerStatus::ignored`: returns all the pubkeys from
    ///   `only_safe` *plus* those still undergoing protection. This is useful
    ///   for collecting duties or other non-signing tasks.
    fn voting_pubkeys<I, F>(&self, filter_func: F) -> I
    where
        I: FromIterator<PublicKeyBytes>,
        F: Fn(DoppelgangerStatus) -> Option<PublicKeyBytes>;

    /// Check if the `validator_pubkey` is permitted by the doppleganger
    /// protection to sign messages.
    fn doppelganger_protection_allows_signing(&self, validator_pubkey: PublicKeyBytes) -> bool;

    fn num_voting_validators(&self) -> usize;

    /// The process-wide slashing latch, shared with the event pipeline.
    fn slashing_latch(&self) -> &SlashingLatch;

    fn graffiti(&self, validator_pubkey: &PublicKeyBytes) -> Option<Graffiti>;

    /// Returns the fee recipient for the given public key. The priority
    /// order for fetching the fee recipient is a per-validator override
    /// followed by the process-level default.
    fn get_fee_recipient(&self, validator_pubkey: &PublicKeyBytes) -> Option<Address>;

    fn randao_reveal(
        &self,
        validator_pubkey: PublicKeyBytes,
        signing_epoch: Epoch,
    ) -> impl Future<Output = Result<SignatureBytes, Error>> + Send;

    /// Signs the header of an unsigned block. The remote signer receives
    /// the header rather than the full body, which is why the caller must
    /// have computed `body_root` over the exact block being proposed.
    fn sign_block(
        &self,
        validator_pubkey: PublicKeyBytes,
        block_header: BeaconBlockHeader,
        current_slot: Slot,
    ) -> impl Future<Output = Result<SignatureBytes, Error>> + Send;

    fn sign_attestation(
        &self,
        validator_pubkey: PublicKeyBytes,
        validator_committee_position: usize,
        attestation: &mut Attestation,
        current_epoch: Epoch,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Signs an `AggregateAndProof` for a given validator.
    fn produce_signed_aggregate_and_proof(
        &self,
        validator_pubkey: PublicKeyBytes,
        aggregator_index: u64,
        aggregate: Attestation,
        selection_proof: SelectionProof,
    ) -> impl Future<Output = Result<SignedAggregateAndProof, Error>> + Send;

    /// Produces a `SelectionProof` for the `slot`, signed by the remote
    /// signer with the key corresponding to `validator_pubkey`.
    fn produce_selection_proof(
        &self,
        validator_pubkey: PublicKeyBytes,
        slot: Slot,
    ) -> impl Future<Output = Result<SelectionProof, Error>> + Send;

    /// Produce a `SyncSelectionProof` for `slot` signed by the key of
    /// `validator_pubkey`.
    fn produce_sync_selection_proof(
        &self,
        validator_pubkey: &PublicKeyBytes,
        slot: Slot,
        subnet_id: SyncSubnetId,
    ) -> impl Future<Output = Result<SyncSelectionProof, Error>> + Send;

    fn produce_sync_committee_signature(
        &self,
        slot: Slot,
        beacon_block_root: types::Hash256,
        validator_index: u64,
        validator_pubkey: &PublicKeyBytes,
    ) -> impl Future<Output = Result<SyncCommitteeMessage, Error>> + Send;

    fn produce_signed_contribution_and_proof(
        &self,
        aggregator_index: u64,
        aggregator_pubkey: PublicKeyBytes,
        contribution: SyncCommitteeContribution,
        selection_proof: SyncSelectionProof,
    ) -> impl Future<Output = Result<SignedContributionAndProof, Error>> + Send;

    fn sign_validator_registration_data(
        &self,
        validator_registration_data: ValidatorRegistrationData,
    ) -> impl Future<Output = Result<SignedValidatorRegistrationData, Error>> + Send;

    fn sign_voluntary_exit(
        &self,
        validator_pubkey: PublicKeyBytes,
        voluntary_exit: VoluntaryExit,
    ) -> impl Future<Output = Result<SignedVoluntaryExit, Error>> + Send;

    /// Returns `ProposalData` for the provided `pubkey` if the validator
    /// is managed by this client.
    fn proposal_data(&self, pubkey: &PublicKeyBytes) -> Option<ProposalData>;

    /// Drops duty-idempotence records too old to matter so the ledger
    /// stays small. Cheap to call once per slot.
    fn prune_signing_ledger(&self, current_epoch: Epoch);
}

/// A convenience alias for checking whether a duty matches the attestation
/// data it is about to sign.
pub fn attestation_matches_duty(
    data: &AttestationData,
    duty_slot: Slot,
    duty_committee_index: u64,
) -> bool {
    data.slot == duty_slot && data.index == duty_committee_index
}

/// A wrapper around `PublicKeyBytes` which encodes information about the
/// status of a validator pubkey with regards to doppelganger protection.
#[derive(Debug, PartialEq)]
pub enum DoppelgangerStatus {
    /// Doppelganger protection has approved this for signing.
    ///
    /// This is because the service has waited some period of time to
    /// detect other instances of this key on the network.
    SigningEnabled(PublicKeyBytes),
    /// Doppelganger protection is still waiting to detect other instances.
    ///
    /// Do not use this pubkey for signing slashable messages!!
    ///
    /// However, it can safely be used for other non-slashable operations
    /// (e.g., collecting duties or subscribing to subnets).
    SigningDisabled(PublicKeyBytes),
    /// This pubkey is unknown to the doppelganger service.
    ///
    /// This represents a serious internal error in the program. This
    /// validator will be permanently disabled!
    UnknownToDoppelganger(PublicKeyBytes),
}

impl DoppelgangerStatus {
    /// Only return a pubkey if it is explicitly safe for doppelganger
    /// protection.
    ///
    /// If `Some(pubkey)` is returned, doppelganger has declared it safe for
    /// signing.
    ///
    /// ## Note
    ///
    /// "Safe" is only best-effort by doppelganger. There is no guarantee
    /// that a doppelganger doesn't exist.
    pub fn only_safe(self) -> Option<PublicKeyBytes> {
        match self {
            DoppelgangerStatus::SigningEnabled(pubkey) => Some(pubkey),
            DoppelgangerStatus::SigningDisabled(_) => None,
            DoppelgangerStatus::UnknownToDoppelganger(_) => None,
        }
    }

    /// Returns a key regardless of whether or not doppelganger has approved
    /// it. Such a key might be used for signing non-slashable messages,
    /// duties collection or other activities.
    ///
    /// If the validator is unknown to doppelganger then `None` will be
    /// returned.
    pub fn ignored(self) -> Option<PublicKeyBytes> {
        match self {
            DoppelgangerStatus::SigningEnabled(pubkey) => Some(pubkey),
            DoppelgangerStatus::SigningDisabled(pubkey) => Some(pubkey),
            DoppelgangerStatus::UnknownToDoppelganger(_) => None,
        }
    }

    /// Only return a pubkey if it will not be used for signing due to
    /// doppelganger detection.
    pub fn only_unsafe(self) -> Option<PublicKeyBytes> {
        match self {
            DoppelgangerStatus::SigningEnabled(_) => None,
            DoppelgangerStatus::SigningDisabled(pubkey) => Some(pubkey),
            DoppelgangerStatus::UnknownToDoppelganger(pubkey) => Some(pubkey),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_write_once() {
        let latch = SlashingLatch::new();
        assert!(!latch.is_set());
        assert!(latch.set(), "first set reports newly-set");
        assert!(latch.is_set());
        assert!(!latch.set(), "second set is a no-op");
        assert!(latch.is_set());
    }

    #[test]
    fn latch_clones_share_state() {
        let latch = SlashingLatch::new();
        let clone = latch.clone();
        latch.set();
        assert!(clone.is_set());
    }

    #[test]
    fn doppelganger_status_filters() {
        let pubkey = PublicKeyBytes::empty();
        assert_eq!(
            DoppelgangerStatus::SigningEnabled(pubkey).only_safe(),
            Some(pubkey)
        );
        assert_eq!(DoppelgangerStatus::SigningDisabled(pubkey).only_safe(), None);
        assert_eq!(
            DoppelgangerStatus::SigningDisabled(pubkey).ignored(),
            Some(pubkey)
        );
        assert_eq!(
            DoppelgangerStatus::UnknownToDoppelganger(pubkey).ignored(),
            None
        );
    }
}
