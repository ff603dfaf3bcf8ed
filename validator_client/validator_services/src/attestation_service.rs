use crate::duties_service::{DutiesService, DutyAndProof};
use crate::event_service::HeadTracker;
use beacon_node_fallback::{ApiTopic, BeaconNodeFallback};
use eth2::types::SseHead;
use futures::future::join_all;
use logging::crit;
use slot_clock::SlotClock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use task_executor::TaskExecutor;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use tree_hash::TreeHash;
use types::{Attestation, AttestationData, ChainSpec, CommitteeIndex, Hash256, Slot};
use validator_store::{Error as ValidatorStoreError, SigningRole, ValidatorStore};

/// Attestation data pinned to an observed head must settle by 4/12 of the
/// slot.
const HEAD_CONSENSUS_NUMERATOR: u32 = 4;
/// Without a head event the fetch starts at 1/3, so consensus gets until
/// 8/12 of the slot, still ahead of the aggregation deadline.
const NO_HEAD_CONSENSUS_NUMERATOR: u32 = 8;
const CONSENSUS_DENOMINATOR: u32 = 12;

/// Builds an `AttestationService`.
pub struct AttestationServiceBuilder<S: ValidatorStore, T: SlotClock + 'static> {
    duties_service: Option<Arc<DutiesService<S, T>>>,
    validator_store: Option<Arc<S>>,
    slot_clock: Option<T>,
    beacon_nodes: Option<Arc<BeaconNodeFallback>>,
    executor: Option<TaskExecutor>,
    chain_spec: Option<Arc<ChainSpec>>,
    head_tracker: Option<Arc<HeadTracker>>,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> AttestationServiceBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            duties_service: None,
            validator_store: None,
            slot_clock: None,
            beacon_nodes: None,
            executor: None,
            chain_spec: None,
            head_tracker: None,
        }
    }

    pub fn duties_service(mut self, service: Arc<DutiesService<S, T>>) -> Self {
        self.duties_service = Some(service);
        self
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

    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn chain_spec(mut self, chain_spec: Arc<ChainSpec>) -> Self {
        self.chain_spec = Some(chain_spec);
        self
    }

    pub fn head_tracker(mut self, head_tracker: Arc<HeadTracker>) -> Self {
        self.head_tracker = Some(head_tracker);
        self
    }

    pub fn build(self) -> Result<AttestationService<S, T>, String> {
        Ok(AttestationService {
            inner: Arc::new(Inner {
                duties_service: self
                    .duties_service
                    .ok_or("Cannot build AttestationService without duties_service")?,
                validator_store: self
                    .validator_store
                    .ok_or("Cannot build AttestationService without validator_store")?,
                slot_clock: self
                    .slot_clock
                    .ok_or("Cannot build AttestationService without slot_clock")?,
                beacon_nodes: self
                    .beacon_nodes
                    .ok_or("Cannot build AttestationService without beacon_nodes")?,
                executor: self
                    .executor
                    .ok_or("Cannot build AttestationService without executor")?,
                chain_spec: self
                    .chain_spec
                    .ok_or("Cannot build AttestationService without chain_spec")?,
                head_tracker: self
                    .head_tracker
                    .ok_or("Cannot build AttestationService without head_tracker")?,
                last_fired_slot: AtomicU64::new(0),
            }),
        })
    }
}

/// Helper to minimise `Arc` usage.
pub struct Inner<S, T> {
    duties_service: Arc<DutiesService<S, T>>,
    validator_store: Arc<S>,
    slot_clock: T,
    beacon_nodes: Arc<BeaconNodeFallback>,
    executor: TaskExecutor,
    chain_spec: Arc<ChainSpec>,
    head_tracker: Arc<HeadTracker>,
    /// High-water mark of fired slots; enforces at most one attestation
    /// round per slot regardless of which trigger arrives first.
    last_fired_slot: AtomicU64,
}

/// Produces attestations either as soon as a head event for the slot is
/// observed, or at 1/3 of the slot if no head arrived in time. Aggregates
/// follow at 2/3 of the slot.
pub struct AttestationService<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for AttestationService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> Deref for AttestationService<S, T> {
    type Target = Inner<S, T>;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> AttestationService<S, T> {
    /// Starts the service with both triggers: the head-event subscription
    /// and the 1/3-slot fallback timer.
    pub fn start_update_service(
        self,
        mut head_rx: mpsc::Receiver<SseHead>,
    ) -> Result<(), String> {
        let duration_to_next_slot = self
            .slot_clock
            .duration_to_next_slot()
            .ok_or("Unable to determine duration to next slot")?;

        info!(
            next_update_millis = duration_to_next_slot.as_millis(),
            "Attestation production service started"
        );

        // Head-driven trigger.
        let service = self.clone();
        self.executor.clone().spawn(
            async move {
                while let Some(head) = head_rx.recv().await {
                    if service.slot_clock.now() == Some(head.slot) {
                        service.fire(head.slot, Some(head.block));
                    }
                }
            },
            "attestation_head_trigger",
        );

        // Deadline trigger at 1/3 of every slot.
        let service = self.clone();
        let executor = self.executor.clone();
        executor.spawn(
            async move {
                loop {
                    if let Some(duration_to_next_slot) = service.slot_clock.duration_to_next_slot()
                    {
                        let slot_duration = service.slot_clock.slot_duration();
                        sleep(duration_to_next_slot + slot_duration / 3).await;

                        let Some(slot) = service.slot_clock.now() else {
                            error!("Failed to read slot clock");
                            continue;
                        };
                        // A head event observed earlier this slot is still
                        // used for pinning even when the timer wins the
                        // race to fire.
                        service.fire(slot, service.head_tracker.head_for(slot));
                    } else {
                        error!("Failed to read slot clock");
                        sleep(service.slot_clock.slot_duration()).await;
                        continue;
                    }
                }
            },
            "attestation_service",
        );
        Ok(())
    }

    /// Fires the attestation round for `slot` exactly once.
    fn fire(&self, slot: Slot, known_head: Option<Hash256>) {
        let previous = self.last_fired_slot.fetch_max(slot.as_u64(), Ordering::SeqCst);
        if previous >= slot.as_u64() && slot.as_u64() != 0 {
            return;
        }

        // Safety interlock: a latched process stops before any duty work.
        if self.validator_store.slashing_latch().is_set() {
            warn!(%slot, "Skipping attestation duties: slashing detected");
            return;
        }

        if let Err(e) = self.spawn_attestation_tasks(slot, known_head) {
            crit!(error = e, "Failed to spawn attestation tasks")
        } else {
            trace!(%slot, head_known = known_head.is_some(), "Spawned attestation tasks");
        }
    }

    /// For each committee with duties at `slot`, spawn a task that reaches
    /// consensus on the data, signs and publishes attestations, and later
    /// aggregates.
    fn spawn_attestation_tasks(
        &self,
        slot: Slot,
        known_head: Option<Hash256>,
    ) -> Result<(), String> {
        let duration_to_next_slot = self
            .slot_clock
            .duration_to_next_slot()
            .ok_or("Unable to determine duration to next slot")?;
        let slot_duration = self.slot_clock.slot_duration();

        // Aggregates are produced at 2/3 of the slot.
        let aggregate_production_instant = Instant::now()
            + duration_to_next_slot
                .checked_sub(slot_duration / 3)
                .unwrap_or_else(|| std::time::Duration::from_secs(0));

        // Consensus cut-off: 4/12 of the slot with a known head, 8/12
        // otherwise. In-flight fetches are dropped at this instant.
        let numerator = if known_head.is_some() {
            HEAD_CONSENSUS_NUMERATOR
        } else {
            NO_HEAD_CONSENSUS_NUMERATOR
        };
        let from_slot_start = slot_duration * numerator / CONSENSUS_DENOMINATOR;
        let consensus_deadline = Instant::now()
            + (duration_to_next_slot + from_slot_start)
                .checked_sub(slot_duration)
                .unwrap_or_else(|| std::time::Duration::from_secs(0));

        let duties_by_committee_index: HashMap<CommitteeIndex, Vec<DutyAndProof>> = self
            .duties_service
            .attesters(slot)
            .into_iter()
            .fold(HashMap::new(), |mut map, duty_and_proof| {
                map.entry(duty_and_proof.duty.committee_index)
                    .or_default()
                    .push(duty_and_proof);
                map
            });

        for (committee_index, validator_duties) in duties_by_committee_index {
            self.inner.executor.spawn_ignoring_error(
                self.clone().publish_attestations_and_aggregates(
                    slot,
                    committee_index,
                    validator_duties,
                    known_head,
                    consensus_deadline,
                    aggregate_production_instant,
                ),
                "attestation publish",
            );
        }

        Ok(())
    }

    async fn publish_attestations_and_aggregates(
        self,
        slot: Slot,
        committee_index: CommitteeIndex,
        validator_duties: Vec<DutyAndProof>,
        known_head: Option<Hash256>,
        consensus_deadline: Instant,
        aggregate_production_instant: Instant,
    ) -> Result<(), ()> {
        let attestations_timer = metrics::start_timer_vec(
            &validator_metrics::ATTESTATION_SERVICE_TIMES,
            &[validator_metrics::ATTESTATIONS],
        );

        if validator_duties.is_empty() {
            return Ok(());
        }

        let attestation_opt = self
            .produce_and_publish_attestations(
                slot,
                committee_index,
                &validator_duties,
                known_head,
                consensus_deadline,
            )
            .await
            .map_err(move |e| {
                crit!(
                    error = format!("{:?}", e),
                    committee_index,
                    slot = slot.as_u64(),
                    "Error during attestation routine"
                )
            })?;

        drop(attestations_timer);

        if let Some(attestation_data) = attestation_opt {
            // Wait until 2/3 of the slot before aggregating.
            sleep_until(aggregate_production_instant).await;

            let _aggregates_timer = metrics::start_timer_vec(
                &validator_metrics::ATTESTATION_SERVICE_TIMES,
                &[validator_metrics::AGGREGATES],
            );

            self.produce_and_publish_aggregates(&attestation_data, &validator_duties)
                .await
                .map_err(move |e| {
                    crit!(
                        error = format!("{:?}", e),
                        committee_index,
                        slot = slot.as_u64(),
                        "Error during attestation routine"
                    )
                })?;
        }

        Ok(())
    }

    /// Establishes cross-node consensus on the attestation data, then
    /// signs and publishes one attestation per scheduled validator.
    async fn produce_and_publish_attestations(
        &self,
        slot: Slot,
        committee_index: CommitteeIndex,
        validator_duties: &[DutyAndProof],
        known_head: Option<Hash256>,
        consensus_deadline: Instant,
    ) -> Result<Option<AttestationData>, String> {
        if validator_duties.is_empty() {
            return Ok(None);
        }

        let current_epoch = self
            .slot_clock
            .now()
            .ok_or("Unable to determine current slot from clock")?
            .epoch(self.chain_spec.slots_per_epoch);

        // Even with a known head, the source/target view must reach the
        // same threshold before anything is signed.
        self.beacon_nodes
            .confirm_finality_checkpoints(current_epoch, consensus_deadline)
            .await
            .map_err(|e| format!("Checkpoint confirmation failed: {}", e))?;

        let attestation_data = match self
            .beacon_nodes
            .attestation_data_consensus(slot, committee_index, known_head, consensus_deadline)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                // The duty is abandoned for this slot; it is never retried.
                warn!(
                    %slot,
                    committee_index,
                    error = %e,
                    "Attestation data consensus not reached; duty abandoned"
                );
                return Ok(None);
            }
        };

        let submission_timer = Instant::now();

        // Sign with every scheduled validator in parallel.
        let attestation_data_ref = &attestation_data;
        let signing_futures = validator_duties.iter().map(|duty_and_proof| async move {
            let duty = &duty_and_proof.duty;

            if !validator_store::attestation_matches_duty(
                attestation_data_ref,
                duty.slot,
                duty.committee_index,
            ) {
                crit!(
                    validator = ?duty.pubkey,
                    duty_slot = ?duty.slot,
                    attestation_slot = %attestation_data_ref.slot,
                    duty_index = duty.committee_index,
                    attestation_index = attestation_data_ref.index,
                    "Inconsistent validator duties during signing"
                );
                return None;
            }

            let mut attestation = match Attestation::empty_for_signing(
                *attestation_data_ref,
                duty.committee_length as usize,
                duty.validator_committee_index as usize,
            ) {
                Ok(attestation) => attestation,
                Err(err) => {
                    crit!(
                        validator = ?duty.pubkey,
                        ?duty,
                        ?err,
                        "Invalid validator duties during signing"
                    );
                    return None;
                }
            };

            match self
                .validator_store
                .sign_attestation(
                    duty.pubkey,
                    duty.validator_committee_index as usize,
                    &mut attestation,
                    current_epoch,
                )
                .await
            {
                Ok(()) => Some(attestation),
                Err(ValidatorStoreError::SlashingDetected) => {
                    warn!(
                        validator = ?duty.pubkey,
                        slot = slot.as_u64(),
                        "Attestation not signed: slashing detected"
                    );
                    None
                }
                Err(ValidatorStoreError::DutyAlreadyPerformed { .. }) => {
                    debug!(
                        validator = ?duty.pubkey,
                        slot = slot.as_u64(),
                        "Attestation already signed for this slot"
                    );
                    None
                }
                Err(ValidatorStoreError::UnknownPubkey(pubkey)) => {
                    // A pubkey can be missing when a validator was recently
                    // removed via the keymanager.
                    warn!(
                        info = "a validator may have recently been removed from this VC",
                        pubkey = ?pubkey,
                        committee_index = committee_index,
                        slot = slot.as_u64(),
                        "Missing pubkey for attestation"
                    );
                    None
                }
                Err(e) => {
                    crit!(
                        error = ?e,
                        validator = ?duty.pubkey,
                        committee_index,
                        slot = slot.as_u64(),
                        "Failed to sign attestation"
                    );
                    None
                }
            }
        });

        let attestations: Vec<Attestation> = join_all(signing_futures)
            .await
            .into_iter()
            .flatten()
            .collect();

        if attestations.is_empty() {
            warn!("No attestations were published");
            return Ok(None);
        }

        let attestations_slice = attestations.as_slice();
        match self
            .beacon_nodes
            .request(ApiTopic::Attestations, |beacon_node| async move {
                let _timer = metrics::start_timer_vec(
                    &validator_metrics::ATTESTATION_SERVICE_TIMES,
                    &[validator_metrics::ATTESTATIONS_HTTP_POST],
                );
                beacon_node
                    .post_beacon_pool_attestations(attestations_slice)
                    .await
            })
            .await
        {
            Ok(()) => {
                metrics::observe_vec(
                    &validator_metrics::DUTY_SUBMISSION_TIME,
                    &[SigningRole::Attestation.as_str()],
                    submission_timer.elapsed().as_secs_f64(),
                );
                info!(
                    count = attestations.len(),
                    head_block = ?attestation_data.beacon_block_root,
                    committee_index = attestation_data.index,
                    slot = attestation_data.slot.as_u64(),
                    "type" = "unaggregated",
                    "Successfully published attestations"
                )
            }
            Err(e) => error!(
                error = %e,
                committee_index = attestation_data.index,
                slot = slot.as_u64(),
                "type" = "unaggregated",
                "Unable to publish attestations"
            ),
        }

        Ok(Some(attestation_data))
    }

    /// Downloads the best aggregate across beacon nodes, converts it into
    /// a `SignedAggregateAndProof` per elected aggregator and publishes.
    async fn produce_and_publish_aggregates(
        &self,
        attestation_data: &AttestationData,
        validator_duties: &[DutyAndProof],
    ) -> Result<(), String> {
        if !validator_duties
            .iter()
            .any(|duty_and_proof| duty_and_proof.selection_proof.is_some())
        {
            // Exit early if no validator is an aggregator.
            return Ok(());
        }

        if self.validator_store.slashing_latch().is_set() {
            warn!(slot = %attestation_data.slot, "Skipping aggregation duties: slashing detected");
            return Ok(());
        }

        let slot = attestation_data.slot;
        // The remaining slot third is the budget for collecting candidate
        // aggregates.
        let deadline = Instant::now() + self.slot_clock.slot_duration() / 3;

        let aggregate = self
            .beacon_nodes
            .best_aggregate(slot, attestation_data.tree_hash_root(), deadline)
            .await
            .map_err(|e| format!("Failed to produce an aggregate attestation: {}", e))?;

        let submission_timer = Instant::now();
        let signing_futures = validator_duties.iter().map(|duty_and_proof| {
            let aggregate = aggregate.clone();
            async move {
                let duty = &duty_and_proof.duty;
                let selection_proof = duty_and_proof.selection_proof.clone()?;

                match self
                    .validator_store
                    .produce_signed_aggregate_and_proof(
                        duty.pubkey,
                        duty.validator_index,
                        aggregate,
                        selection_proof,
                    )
                    .await
                {
                    Ok(aggregate) => Some(aggregate),
                    Err(ValidatorStoreError::UnknownPubkey(pubkey)) => {
                        debug!(?pubkey, "Missing pubkey for aggregate");
                        None
                    }
                    Err(e) => {
                        crit!(
                            error = ?e,
                            pubkey = ?duty.pubkey,
                            "Failed to sign aggregate"
                        );
                        None
                    }
                }
            }
        });

        let signed_aggregate_and_proofs = join_all(signing_futures)
            .await
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        if !signed_aggregate_and_proofs.is_empty() {
            let signed_aggregate_and_proofs_slice = signed_aggregate_and_proofs.as_slice();
            match self
                .beacon_nodes
                .first_success(|beacon_node| async move {
                    let _timer = metrics::start_timer_vec(
                        &validator_metrics::ATTESTATION_SERVICE_TIMES,
                        &[validator_metrics::AGGREGATES_HTTP_POST],
                    );
                    beacon_node
                        .post_validator_aggregate_and_proof(signed_aggregate_and_proofs_slice)
                        .await
                })
                .await
            {
                Ok(()) => {
                    metrics::observe_vec(
                        &validator_metrics::DUTY_SUBMISSION_TIME,
                        &[SigningRole::Aggregate.as_str()],
                        submission_timer.elapsed().as_secs_f64(),
                    );
                    for signed_aggregate_and_proof in signed_aggregate_and_proofs {
                        let attestation = &signed_aggregate_and_proof.message.aggregate;
                        info!(
                            aggregator = signed_aggregate_and_proof.message.aggregator_index,
                            signatures = attestation.num_set_aggregation_bits(),
                            head_block = format!("{:?}", attestation.data.beacon_block_root),
                            committee_index = attestation.data.index,
                            slot = attestation.data.slot.as_u64(),
                            "type" = "aggregated",
                            "Successfully published attestation"
                        );
                    }
                }
                Err(e) => {
                    for signed_aggregate_and_proof in signed_aggregate_and_proofs {
                        let attestation = &signed_aggregate_and_proof.message.aggregate;
                        crit!(
                            error = %e,
                            aggregator = signed_aggregate_and_proof.message.aggregator_index,
                            committee_index = attestation.data.index,
                            slot = attestation.data.slot.as_u64(),
                            "type" = "aggregated",
                            "Failed to publish attestation"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    /// When attestation-data consensus runs long, the 2/3-slot aggregation
    /// instant may already have passed by the time the round waits on it.
    /// `publish_attestations_and_aggregates` relies on that wait resolving
    /// immediately so an overdue aggregation duty still fires instead of
    /// being lost for the slot.
    #[tokio::test]
    async fn overdue_aggregation_instant_still_fires() {
        let aggregate_production_instant = Instant::now() - Duration::from_secs(2);
        let round_started = Instant::now();

        sleep_until(aggregate_production_instant).await;

        assert!(
            round_started.elapsed() < Duration::from_millis(500),
            "an overdue aggregation deadline must not stall the round"
        );
    }

    #[test]
    fn high_water_mark_allows_each_slot_once() {
        let mark = AtomicU64::new(0);
        let fire = |slot: u64| {
            let previous = mark.fetch_max(slot, Ordering::SeqCst);
            !(previous >= slot && slot != 0)
        };

        assert!(fire(0), "genesis slot fires");
        assert!(fire(5), "first trigger for slot 5 fires");
        assert!(!fire(5), "second trigger for slot 5 is suppressed");
        assert!(!fire(4), "older slots never fire after a newer one");
        assert!(fire(6));
    }
}
