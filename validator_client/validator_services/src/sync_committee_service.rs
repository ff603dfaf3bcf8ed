use crate::duties_service::DutiesService;
use crate::event_service::HeadTracker;
use beacon_node_fallback::{ApiTopic, BeaconNodeFallback};
use eth2::types::BlockId;
use logging::crit;
use slot_clock::SlotClock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use task_executor::TaskExecutor;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use types::{Hash256, Slot, SyncDuty, SyncSelectionProof, SyncSubnetId};
use validator_store::{Error as ValidatorStoreError, SigningRole, ValidatorStore};

pub struct SyncCommitteeService<S: ValidatorStore, T: SlotClock + 'static> {
    inner: Arc<Inner<S, T>>,
}

impl<S: ValidatorStore, T: SlotClock + 'static> Clone for SyncCommitteeService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ValidatorStore, T: SlotClock + 'static> Deref for SyncCommitteeService<S, T> {
    type Target = Inner<S, T>;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

pub struct Inner<S, T> {
    duties_service: Arc<DutiesService<S, T>>,
    validator_store: Arc<S>,
    slot_clock: T,
    beacon_nodes: Arc<BeaconNodeFallback>,
    head_tracker: Arc<HeadTracker>,
    executor: TaskExecutor,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> SyncCommitteeService<S, T> {
    pub fn new(
        duties_service: Arc<DutiesService<S, T>>,
        validator_store: Arc<S>,
        slot_clock: T,
        beacon_nodes: Arc<BeaconNodeFallback>,
        head_tracker: Arc<HeadTracker>,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                duties_service,
                validator_store,
                slot_clock,
                beacon_nodes,
                head_tracker,
                executor,
            }),
        }
    }

    pub fn start_update_service(self) -> Result<(), String> {
        let slot_duration = self.slot_clock.slot_duration();
        let duration_to_next_slot = self
            .slot_clock
            .duration_to_next_slot()
            .ok_or("Unable to determine duration to next slot")?;

        info!(
            next_update_millis = duration_to_next_slot.as_millis(),
            "Sync committee service started"
        );

        let executor = self.executor.clone();

        let interval_fut = async move {
            loop {
                if let Some(duration_to_next_slot) = self.slot_clock.duration_to_next_slot() {
                    // Sync messages are due at the same 1/3 offset as
                    // attestations.
                    sleep(duration_to_next_slot + slot_duration / 3).await;

                    if let Err(e) = self.spawn_contribution_tasks(slot_duration) {
                        crit!(error = e, "Failed to spawn sync contribution tasks")
                    } else {
                        trace!("Spawned sync contribution tasks");
                    }
                } else {
                    error!("Failed to read slot clock");
                    // If we can't read the slot clock, just wait another slot.
                    sleep(slot_duration).await;
                }
            }
        };

        executor.spawn(interval_fut, "sync_committee_service");
        Ok(())
    }

    fn spawn_contribution_tasks(&self, slot_duration: Duration) -> Result<(), String> {
        let slot = self.slot_clock.now().ok_or("Failed to read slot clock")?;
        let duration_to_next_slot = self
            .slot_clock
            .duration_to_next_slot()
            .ok_or("Unable to determine duration to next slot")?;

        // Contributions are published at 2/3 through the slot.
        let aggregate_production_instant = Instant::now()
            + duration_to_next_slot
                .checked_sub(slot_duration / 3)
                .unwrap_or_else(|| Duration::from_secs(0));

        let epoch = slot.epoch(self.duties_service.spec.slots_per_epoch);
        let duties = self
            .duties_service
            .sync_duties
            .duties_for_epoch(epoch, &self.duties_service.spec);

        if duties.is_empty() {
            debug!(%slot, "No local validators in current sync committee");
            return Ok(());
        }

        if self.validator_store.slashing_latch().is_set() {
            warn!(%slot, "Skipping sync committee duties: slashing detected");
            return Ok(());
        }

        self.executor.spawn_ignoring_error(
            self.clone()
                .publish_signatures_and_contributions(slot, duties, aggregate_production_instant),
            "sync_committee_publish",
        );

        Ok(())
    }

    async fn publish_signatures_and_contributions(
        self,
        slot: Slot,
        duties: Vec<SyncDuty>,
        aggregate_production_instant: Instant,
    ) -> Result<(), ()> {
        let _timer = metrics::start_timer_vec(
            &validator_metrics::SYNC_COMMITTEE_SERVICE_TIMES,
            &[validator_metrics::FULL_UPDATE],
        );

        // Sign the head observed via the event pipeline; fall back to
        // asking the healthiest node when no event arrived this slot.
        let beacon_block_root = match self.head_tracker.head_for(slot) {
            Some(root) => root,
            None => self
                .beacon_nodes
                .first_success(|beacon_node| async move {
                    beacon_node.get_beacon_blocks_root(BlockId::Head).await
                })
                .await
                .map_err(|e| {
                    error!(
                        %slot,
                        error = %e,
                        "Unable to determine head block root for sync messages"
                    )
                })?
                .ok_or_else(|| error!(%slot, "No head block root known"))?
                .data
                .root,
        };

        let submission_timer = Instant::now();

        // Publish one sync committee message per duty.
        let mut messages = Vec::with_capacity(duties.len());
        for duty in &duties {
            match self
                .validator_store
                .produce_sync_committee_signature(
                    slot,
                    beacon_block_root,
                    duty.validator_index,
                    &duty.pubkey,
                )
                .await
            {
                Ok(message) => messages.push(message),
                Err(ValidatorStoreError::SlashingDetected) => {
                    warn!(%slot, "Sync message not signed: slashing detected");
                    return Err(());
                }
                Err(ValidatorStoreError::DutyAlreadyPerformed { .. }) => {
                    debug!(
                        validator_index = duty.validator_index,
                        %slot,
                        "Sync message already signed for this slot"
                    );
                }
                Err(e) => {
                    crit!(
                        error = ?e,
                        validator_index = duty.validator_index,
                        %slot,
                        "Failed to sign sync committee message"
                    );
                }
            }
        }

        if messages.is_empty() {
            return Ok(());
        }

        let messages_slice = messages.as_slice();
        match self
            .beacon_nodes
            .request(ApiTopic::SyncCommittee, |beacon_node| async move {
                beacon_node
                    .post_beacon_pool_sync_committees(messages_slice)
                    .await
            })
            .await
        {
            Ok(()) => {
                metrics::observe_vec(
                    &validator_metrics::DUTY_SUBMISSION_TIME,
                    &[SigningRole::SyncCommitteeMessage.as_str()],
                    submission_timer.elapsed().as_secs_f64(),
                );
                info!(
                    count = messages.len(),
                    head_block = ?beacon_block_root,
                    %slot,
                    "Successfully published sync committee messages"
                )
            }
            Err(e) => {
                error!(
                    error = %e,
                    %slot,
                    "Unable to publish sync committee messages"
                );
                return Err(());
            }
        }

        // Compute selection proofs now so aggregator election is settled
        // before the contribution deadline.
        let spec = &self.duties_service.spec;
        let mut aggregators: HashMap<SyncSubnetId, Vec<(SyncDuty, SyncSelectionProof)>> =
            HashMap::new();
        for duty in &duties {
            for subnet_id in duty.subnet_ids(spec) {
                let proof = match self
                    .validator_store
                    .produce_sync_selection_proof(&duty.pubkey, slot, subnet_id)
                    .await
                {
                    Ok(proof) => proof,
                    Err(e) => {
                        warn!(
                            error = ?e,
                            validator_index = duty.validator_index,
                            subnet_id,
                            "Unable to sign sync selection proof"
                        );
                        continue;
                    }
                };
                if proof.is_aggregator(spec) {
                    aggregators
                        .entry(subnet_id)
                        .or_default()
                        .push((duty.clone(), proof));
                }
            }
        }

        if aggregators.is_empty() {
            return Ok(());
        }

        sleep_until(aggregate_production_instant).await;
        self.publish_contributions(slot, beacon_block_root, aggregators)
            .await;

        Ok(())
    }

    /// Downloads the best contribution per subnet and publishes a signed
    /// `ContributionAndProof` for every elected aggregator.
    async fn publish_contributions(
        &self,
        slot: Slot,
        beacon_block_root: Hash256,
        aggregators: HashMap<SyncSubnetId, Vec<(SyncDuty, SyncSelectionProof)>>,
    ) {
        let submission_timer = Instant::now();
        let mut signed_contributions = vec![];
        // The remaining slot third is the budget for collecting candidate
        // contributions.
        let deadline = Instant::now() + self.slot_clock.slot_duration() / 3;

        for (subnet_id, subnet_aggregators) in aggregators {
            let contribution = match self
                .beacon_nodes
                .best_sync_contribution(slot, subnet_id, beacon_block_root, deadline)
                .await
            {
                Ok(contribution) => contribution,
                Err(e) => {
                    error!(
                        %slot,
                        subnet_id,
                        error = %e,
                        "Unable to fetch sync contribution"
                    );
                    continue;
                }
            };

            for (duty, proof) in subnet_aggregators {
                match self
                    .validator_store
                    .produce_signed_contribution_and_proof(
                        duty.validator_index,
                        duty.pubkey,
                        contribution.clone(),
                        proof.clone(),
                    )
                    .await
                {
                    Ok(signed) => signed_contributions.push(signed),
                    Err(ValidatorStoreError::DutyAlreadyPerformed { .. }) => {
                        debug!(
                            validator_index = duty.validator_index,
                            %slot,
                            "Sync contribution already signed for this slot"
                        );
                    }
                    Err(e) => {
                        crit!(
                            error = ?e,
                            validator_index = duty.validator_index,
                            "Failed to sign sync contribution"
                        );
                    }
                }
            }
        }

        if signed_contributions.is_empty() {
            return;
        }

        let contributions_slice = signed_contributions.as_slice();
        match self
            .beacon_nodes
            .first_success(|beacon_node| async move {
                beacon_node
                    .post_validator_contribution_and_proofs(contributions_slice)
                    .await
            })
            .await
        {
            Ok(()) => {
                metrics::observe_vec(
                    &validator_metrics::DUTY_SUBMISSION_TIME,
                    &[SigningRole::SyncCommitteeContribution.as_str()],
                    submission_timer.elapsed().as_secs_f64(),
                );
                for contribution in signed_contributions {
                    info!(
                        aggregator = contribution.message.aggregator_index,
                        signatures = contribution.message.contribution.num_set_aggregation_bits(),
                        subnet = contribution.message.contribution.subcommittee_index,
                        %slot,
                        "Successfully published sync contribution"
                    );
                }
            }
            Err(e) => crit!(
                error = %e,
                %slot,
                "Failed to publish sync contributions"
            ),
        }
    }
}
