use crate::block_service::BlockServiceNotification;
use crate::sync_duties::SyncDutiesMap;
use beacon_node_fallback::BeaconNodeFallback;
use eth2::types::{AttesterData, ProposerData, StateId, ValidatorId};
use logging::crit;
use parking_lot::RwLock;
use slot_clock::SlotClock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use task_executor::TaskExecutor;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use types::{ChainSpec, Epoch, Hash256, PublicKeyBytes, SelectionProof, Slot};
use validator_store::{DoppelgangerStatus, ValidatorStore};

/// Only retain duties from the current epoch and the epoch prior.
const HISTORICAL_DUTIES_EPOCHS: u64 = 2;

/// An attester duty together with its pre-computed selection proof, when
/// the proof elected the validator as an aggregator.
#[derive(Debug, Clone)]
pub struct DutyAndProof {
    pub duty: AttesterData,
    pub selection_proof: Option<SelectionProof>,
}

impl DutyAndProof {
    /// Computes the selection proof through the remote signer and stores
    /// it only if it elects the validator as an aggregator.
    pub async fn new_with_selection_proof<S: ValidatorStore>(
        duty: AttesterData,
        validator_store: &S,
        spec: &ChainSpec,
    ) -> Result<Self, validator_store::Error> {
        let selection_proof = validator_store
            .produce_selection_proof(duty.pubkey, duty.slot)
            .await?;
        let selection_proof = selection_proof
            .is_aggregator(duty.committee_length as usize, spec)
            .then_some(selection_proof);
        Ok(Self {
            duty,
            selection_proof,
        })
    }
}

type DependentRoot = Hash256;
type AttesterMap = HashMap<PublicKeyBytes, HashMap<Epoch, (DependentRoot, DutyAndProof)>>;
type ProposerMap = HashMap<Epoch, (DependentRoot, Vec<ProposerData>)>;

/// Builds a `DutiesService`.
#[derive(Default)]
pub struct DutiesServiceBuilder<S, T> {
    validator_store: Option<Arc<S>>,
    slot_clock: Option<T>,
    beacon_nodes: Option<Arc<BeaconNodeFallback>>,
    registry: Option<Arc<validator_registry::ValidatorRegistry>>,
    executor: Option<TaskExecutor>,
    spec: Option<Arc<ChainSpec>>,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> DutiesServiceBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            validator_store: None,
            slot_clock: None,
            beacon_nodes: None,
            registry: None,
            executor: None,
            spec: None,
        }
    }

    pub fn validator_store(mut self, store: Arc<S>) -> Self {
        self.validator_store = Some(store);
        self
    }

    pub fn slot_clock(mut self, slot_clock: T) -> Self {
        self.slot_clock = Some(slot_clock);
        self
    }

    pub fn beacon_nodes(mut self, beacon_nodes: Arc<BeaconNodeFallback>) -> Self {
        self.beacon_nodes = Some(beacon_nodes);
        self
    }

    pub fn registry(mut self, registry: Arc<validator_registry::ValidatorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn spec(mut self, spec: Arc<ChainSpec>) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn build(self) -> Result<DutiesService<S, T>, String> {
        Ok(DutiesService {
            attesters: RwLock::new(HashMap::new()),
            proposers: RwLock::new(HashMap::new()),
            sync_duties: SyncDutiesMap::default(),
            validator_store: self
                .validator_store
                .ok_or("Cannot build DutiesService without validator_store")?,
            slot_clock: self
                .slot_clock
                .ok_or("Cannot build DutiesService without slot_clock")?,
            beacon_nodes: self
                .beacon_nodes
                .ok_or("Cannot build DutiesService without beacon_nodes")?,
            registry: self
                .registry
                .ok_or("Cannot build DutiesService without registry")?,
            executor: self
                .executor
                .ok_or("Cannot build DutiesService without executor")?,
            spec: self.spec.ok_or("Cannot build DutiesService without spec")?,
        })
    }
}

/// Maintains duties for all managed validators.
///
/// Polls once per slot: validator indices and statuses refresh at epoch
/// boundaries, attester duties are kept for the current and next epoch
/// with selection proofs pre-computed, proposer duties for the current
/// epoch, and sync duties per sync-committee period.
pub struct DutiesService<S, T> {
    pub attesters: RwLock<AttesterMap>,
    pub proposers: RwLock<ProposerMap>,
    pub sync_duties: SyncDutiesMap,
    pub validator_store: Arc<S>,
    pub slot_clock: T,
    pub beacon_nodes: Arc<BeaconNodeFallback>,
    pub registry: Arc<validator_registry::ValidatorRegistry>,
    pub executor: TaskExecutor,
    pub spec: Arc<ChainSpec>,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> DutiesService<S, T> {
    /// Returns the attester duties (with proofs) for `slot`.
    pub fn attesters(&self, slot: Slot) -> Vec<DutyAndProof> {
        let epoch = slot.epoch(self.spec.slots_per_epoch);
        self.attesters
            .read()
            .values()
            .filter_map(|by_epoch| by_epoch.get(&epoch))
            .filter(|(_, duty_and_proof)| duty_and_proof.duty.slot == slot)
            .map(|(_, duty_and_proof)| duty_and_proof.clone())
            .collect()
    }

    /// Returns the pubkeys of managed validators proposing at `slot`.
    pub fn block_proposers(&self, slot: Slot) -> Vec<PublicKeyBytes> {
        let epoch = slot.epoch(self.spec.slots_per_epoch);
        self.proposers
            .read()
            .get(&epoch)
            .map(|(_, proposers)| {
                proposers
                    .iter()
                    .filter(|data| data.slot == slot)
                    .map(|data| data.pubkey)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `true` if any managed validator proposes within
    /// `(current_slot, current_slot + slots]`. Consulted by the deferred
    /// shutdown path.
    pub fn proposal_imminent(&self, current_slot: Slot, slots: u64) -> bool {
        (1..=slots).any(|offset| !self.block_proposers(current_slot + offset).is_empty())
    }

    /// Dumps cached duties derived from `epoch` so the next poll re-derives
    /// them (and their selection proofs) from fresh beacon node data.
    pub fn invalidate_epoch(&self, epoch: Epoch) {
        for by_epoch in self.attesters.write().values_mut() {
            by_epoch.remove(&epoch);
        }
        self.proposers.write().remove(&epoch);
        debug!(%epoch, "Cached duties invalidated");
    }

    pub fn start_update_service(
        self: Arc<Self>,
        block_service_tx: mpsc::Sender<BlockServiceNotification>,
    ) {
        let executor = self.executor.clone();
        executor.spawn(
            async move {
                loop {
                    if let Some(duration) = self.slot_clock.duration_to_next_slot() {
                        sleep(duration).await;
                    } else {
                        sleep(self.slot_clock.slot_duration()).await;
                        continue;
                    }
                    self.poll(&block_service_tx).await;
                }
            },
            "duties_service",
        );
    }

    /// One tick, at the start of every slot.
    async fn poll(&self, block_service_tx: &mpsc::Sender<BlockServiceNotification>) {
        let Some(slot) = self.slot_clock.now() else {
            error!("Duties service failed to read slot clock");
            return;
        };
        let epoch = slot.epoch(self.spec.slots_per_epoch);

        // Refresh validators once per epoch, and on the first tick after
        // startup when no record has an index yet.
        if slot.is_epoch_start(self.spec.slots_per_epoch) || self.registry.indices().is_empty() {
            self.refresh_validators().await;
            self.validator_store.prune_signing_ledger(epoch);
        }

        // Proposer duties must be known before the notification fires.
        self.poll_beacon_proposers(epoch).await;

        let notification = BlockServiceNotification {
            slot,
            block_proposers: self.block_proposers(slot),
        };
        if let Err(e) = block_service_tx.try_send(notification) {
            error!(error = %e, "Failed to notify block service");
        }

        // Attester duties for this epoch and the next, then sync duties
        // for the current period (and the next when it is close).
        self.poll_beacon_attesters(epoch).await;
        self.poll_beacon_attesters(epoch + 1u64).await;
        if let Err(e) = self
            .sync_duties
            .poll(
                &self.beacon_nodes,
                &self.registry,
                epoch,
                &self.spec,
            )
            .await
        {
            warn!(error = e, "Failed to poll sync duties");
        }

        self.prune(epoch);
    }

    /// Pulls indices and statuses for every managed key from the chain.
    async fn refresh_validators(&self) {
        let _timer = metrics::start_timer_vec(
            &validator_metrics::DUTIES_SERVICE_TIMES,
            &[validator_metrics::UPDATE_INDICES],
        );
        let ids: Vec<ValidatorId> = self
            .registry
            .pubkeys()
            .into_iter()
            .map(ValidatorId::PublicKey)
            .collect();
        if ids.is_empty() {
            return;
        }

        match self
            .beacon_nodes
            .first_success(|client| {
                let ids = ids.clone();
                async move {
                    client
                        .post_beacon_states_validators(StateId::Head, Some(ids), None)
                        .await
                        .map(|response| response.data)
                }
            })
            .await
        {
            Ok(data) => {
                let outcome = self.registry.apply_chain_view(data);
                if outcome.new_indices > 0 {
                    info!(
                        new = outcome.new_indices,
                        total = self.registry.num_validators(),
                        "Validator indices discovered"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Unable to refresh validator statuses"),
        }
    }

    /// Fetches attester duties for `epoch` for any validator that lacks
    /// them, then pre-computes the selection proofs.
    async fn poll_beacon_attesters(&self, epoch: Epoch) {
        let _timer = metrics::start_timer_vec(
            &validator_metrics::DUTIES_SERVICE_TIMES,
            &[validator_metrics::UPDATE_ATTESTERS],
        );

        // Collect duties for all keys, including those still under
        // doppelganger observation.
        let local_pubkeys: HashSet<PublicKeyBytes> = self
            .validator_store
            .voting_pubkeys(DoppelgangerStatus::ignored);

        let indexed: Vec<(PublicKeyBytes, u64)> = self
            .registry
            .indexed_pubkeys()
            .into_iter()
            .filter(|(pubkey, _)| local_pubkeys.contains(pubkey))
            .collect();
        if indexed.is_empty() {
            return;
        }

        let missing: Vec<u64> = {
            let attesters = self.attesters.read();
            indexed
                .iter()
                .filter(|(pubkey, _)| {
                    attesters
                        .get(pubkey)
                        .map_or(true, |by_epoch| !by_epoch.contains_key(&epoch))
                })
                .map(|(_, index)| *index)
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        let response = match self
            .beacon_nodes
            .first_success(|client| {
                let missing = missing.clone();
                async move { client.post_validator_duties_attester(epoch, &missing).await }
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(%epoch, error = %e, "Failed to download attester duties");
                return;
            }
        };

        let dependent_root = response.dependent_root;
        let relevant: Vec<AttesterData> = response
            .data
            .into_iter()
            .filter(|duty| local_pubkeys.contains(&duty.pubkey))
            .collect();

        debug!(
            %epoch,
            count = relevant.len(),
            "Downloaded attester duties"
        );

        for duty in relevant {
            let duty_and_proof = match DutyAndProof::new_with_selection_proof(
                duty,
                self.validator_store.as_ref(),
                &self.spec,
            )
            .await
            {
                Ok(duty_and_proof) => duty_and_proof,
                Err(validator_store::Error::DoppelgangerProtected(pubkey)) => {
                    debug!(?pubkey, "Skipping selection proof under doppelganger protection");
                    continue;
                }
                Err(e) => {
                    crit!(error = ?e, "Failed to produce selection proof");
                    continue;
                }
            };
            self.attesters
                .write()
                .entry(duty_and_proof.duty.pubkey)
                .or_default()
                .insert(epoch, (dependent_root, duty_and_proof));
        }
    }

    /// Fetches proposer duties for `epoch` if they are not yet known.
    async fn poll_beacon_proposers(&self, epoch: Epoch) {
        if self.proposers.read().contains_key(&epoch) {
            return;
        }
        let _timer = metrics::start_timer_vec(
            &validator_metrics::DUTIES_SERVICE_TIMES,
            &[validator_metrics::UPDATE_PROPOSERS],
        );

        let local_pubkeys: HashSet<PublicKeyBytes> = self
            .validator_store
            .voting_pubkeys(DoppelgangerStatus::ignored);
        if local_pubkeys.is_empty() {
            return;
        }

        match self
            .beacon_nodes
            .first_success(
                |client| async move { client.get_validator_duties_proposer(epoch).await },
            )
            .await
        {
            Ok(response) => {
                let dependent_root = response.dependent_root;
                let relevant: Vec<ProposerData> = response
                    .data
                    .into_iter()
                    .filter(|data| local_pubkeys.contains(&data.pubkey))
                    .collect();
                if !relevant.is_empty() {
                    info!(%epoch, count = relevant.len(), "Block proposal duties this epoch");
                }
                self.proposers
                    .write()
                    .insert(epoch, (dependent_root, relevant));
            }
            Err(e) => warn!(%epoch, error = %e, "Failed to download proposer duties"),
        }
    }

    /// Drops duties older than `HISTORICAL_DUTIES_EPOCHS`.
    fn prune(&self, current_epoch: Epoch) {
        let cutoff = current_epoch.saturating_sub(HISTORICAL_DUTIES_EPOCHS);
        {
            let mut attesters = self.attesters.write();
            for by_epoch in attesters.values_mut() {
                by_epoch.retain(|epoch, _| *epoch >= cutoff);
            }
            attesters.retain(|_, by_epoch| !by_epoch.is_empty());
        }
        self.proposers.write().retain(|epoch, _| *epoch >= cutoff);
        self.sync_duties.prune(current_epoch, &self.spec);
    }
}
