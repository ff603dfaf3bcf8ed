//! Startup-only doppelganger protection.
//!
//! For three full epochs after a key is registered, the service watches
//! the network for signs the key is live elsewhere, via the liveness
//! endpoint routed through the coordinator. While a key is under
//! observation the store reports it as `SigningDisabled`: duties are still
//! collected, but nothing slashable is signed. A positive detection shuts
//! the process down; letting two instances of one key run is strictly
//! worse than missing every duty.

use beacon_node_fallback::BeaconNodeFallback;
use eth2::types::LivenessResponseData;
use logging::crit;
use parking_lot::RwLock;
use slot_clock::SlotClock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use task_executor::{ShutdownReason, TaskExecutor};
use tokio::time::sleep;
use tracing::{debug, error, info};
use types::{ChainSpec, Epoch, PublicKeyBytes};
use validator_registry::ValidatorRegistry;
use validator_store::DoppelgangerStatus;

/// The number of full epochs a key is observed before signing is enabled.
pub const DEFAULT_REMAINING_DETECTION_EPOCHS: u64 = 3;

/// The shutdown reason raised on a positive detection. The binary matches
/// on this to exit with a dedicated status code.
pub const DOPPELGANGER_SHUTDOWN_REASON: &str = "doppelganger detected";

#[derive(Debug, Clone, Copy, PartialEq)]
struct DoppelgangerState {
    /// The epoch in which observation began; liveness results for this
    /// epoch or earlier are not attributable to another instance.
    registration_epoch: Epoch,
    /// Observation epochs left before the key may sign.
    remaining_epochs: u64,
}

impl DoppelgangerState {
    fn requires_further_checks(&self) -> bool {
        self.remaining_epochs > 0
    }
}

/// Extracts the managed indices that the liveness data reports as live.
/// Pure, so the detection decision is directly testable.
fn violators(responses: &[LivenessResponseData], monitored: &HashSet<u64>) -> Vec<u64> {
    responses
        .iter()
        .filter(|response| response.is_live && monitored.contains(&response.index))
        .map(|response| response.index)
        .collect()
}

pub struct DoppelgangerService {
    states: RwLock<HashMap<PublicKeyBytes, DoppelgangerState>>,
}

impl Default for DoppelgangerService {
    fn default() -> Self {
        Self::new()
    }
}

impl DoppelgangerService {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Registers keys for observation starting at `current_epoch`. Keys
    /// added at runtime through the keymanager pass `bypass = true`: they
    /// skip observation for this process lifetime and are re-checked on
    /// the next startup.
    pub fn register_validators(
        &self,
        pubkeys: impl IntoIterator<Item = PublicKeyBytes>,
        current_epoch: Epoch,
        bypass: bool,
    ) {
        let mut states = self.states.write();
        for pubkey in pubkeys {
            states.entry(pubkey).or_insert(DoppelgangerState {
                registration_epoch: current_epoch,
                remaining_epochs: if bypass {
                    0
                } else {
                    DEFAULT_REMAINING_DETECTION_EPOCHS
                },
            });
        }
    }

    pub fn validator_status(&self, pubkey: PublicKeyBytes) -> DoppelgangerStatus {
        match self.states.read().get(&pubkey) {
            None => DoppelgangerStatus::UnknownToDoppelganger(pubkey),
            Some(state) if state.requires_further_checks() => {
                DoppelgangerStatus::SigningDisabled(pubkey)
            }
            Some(_) => DoppelgangerStatus::SigningEnabled(pubkey),
        }
    }

    /// `true` once every registered key has completed observation.
    pub fn all_keys_enabled(&self) -> bool {
        self.states
            .read()
            .values()
            .all(|state| !state.requires_further_checks())
    }

    /// Starts the per-epoch detection loop.
    pub fn start_update_service<T: SlotClock + 'static>(
        self: Arc<Self>,
        executor: TaskExecutor,
        fallback: Arc<BeaconNodeFallback>,
        registry: Arc<ValidatorRegistry>,
        slot_clock: T,
        spec: Arc<ChainSpec>,
    ) {
        info!(
            epochs = DEFAULT_REMAINING_DETECTION_EPOCHS,
            "Doppelganger detection service started"
        );
        let detection_executor = executor.clone();
        executor.spawn(
            async move {
                loop {
                    // Check towards the end of each epoch so the liveness
                    // data for the epoch is as complete as possible.
                    match slot_clock.duration_to_next_epoch(spec.slots_per_epoch) {
                        Some(duration) => sleep(duration + spec.slot_duration() / 2).await,
                        None => {
                            error!("Failed to read slot clock in doppelganger service");
                            sleep(spec.slot_duration()).await;
                            continue;
                        }
                    }

                    let Some(slot) = slot_clock.now() else {
                        continue;
                    };
                    let epoch = slot.epoch(spec.slots_per_epoch);
                    self.detect_doppelgangers(&detection_executor, &fallback, &registry, epoch)
                        .await;
                }
            },
            "doppelganger_service",
        );
    }

    async fn detect_doppelgangers(
        &self,
        executor: &TaskExecutor,
        fallback: &BeaconNodeFallback,
        registry: &ValidatorRegistry,
        current_epoch: Epoch,
    ) {
        // Indices under observation whose chain index is already known.
        let monitored_pubkeys: Vec<PublicKeyBytes> = self
            .states
            .read()
            .iter()
            .filter(|(_, state)| state.requires_further_checks())
            .map(|(pubkey, _)| *pubkey)
            .collect();

        if monitored_pubkeys.is_empty() {
            return;
        }

        let index_to_pubkey: HashMap<u64, PublicKeyBytes> = monitored_pubkeys
            .iter()
            .filter_map(|pubkey| Some((registry.index_of(pubkey)?, *pubkey)))
            .collect();
        let monitored: HashSet<u64> = index_to_pubkey.keys().copied().collect();

        if monitored.is_empty() {
            // No indices known yet: the chain hasn't seen these keys, so
            // there is nothing to observe. Observation epochs still burn
            // down below only for keys with indices.
            debug!("No indexed validators to observe for doppelgangers");
            return;
        }

        let indices: Vec<u64> = monitored.iter().copied().collect();

        // Check the just-completed epoch as well as the current one, so a
        // doppelganger attesting right before an epoch boundary is seen.
        let previous_epoch = current_epoch.saturating_sub(1u64);
        for epoch in [previous_epoch, current_epoch] {
            let responses = match fallback
                .first_success(|client| {
                    let indices = indices.clone();
                    async move {
                        client
                            .post_validator_liveness_epoch(epoch, &indices)
                            .await
                            .map(|response| response.data)
                    }
                })
                .await
            {
                Ok(responses) => responses,
                Err(e) => {
                    // Without liveness data nothing can be ruled out;
                    // observation is not credited for this epoch.
                    error!(
                        %epoch,
                        error = %e,
                        "Unable to fetch liveness data for doppelganger detection"
                    );
                    return;
                }
            };

            let live = violators(&responses, &monitored);
            if !live.is_empty() {
                let pubkeys: Vec<_> = live
                    .iter()
                    .filter_map(|index| index_to_pubkey.get(index))
                    .collect();
                crit!(
                    indices = ?live,
                    pubkeys = ?pubkeys,
                    "Doppelganger detected! A validator is live elsewhere. Shutting down to avoid slashing"
                );
                metrics::set_gauge(&validator_metrics::DOPPELGANGER_DETECTED, 1);
                executor.shutdown(ShutdownReason::Failure(DOPPELGANGER_SHUTDOWN_REASON));
                return;
            }
        }

        // A clean pass over a full epoch of liveness data: credit one
        // observation epoch to keys registered before this epoch began.
        let mut states = self.states.write();
        let mut newly_enabled = vec![];
        for (pubkey, state) in states.iter_mut() {
            if state.requires_further_checks()
                && state.registration_epoch < current_epoch
                && index_to_pubkey.values().any(|p| p == pubkey)
            {
                state.remaining_epochs -= 1;
                if !state.requires_further_checks() {
                    newly_enabled.push(*pubkey);
                }
            }
        }
        drop(states);

        for pubkey in newly_enabled {
            info!(
                ?pubkey,
                "Doppelganger observation complete; signing enabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes::deserialize(&[byte; 48]).unwrap()
    }

    fn live(index: u64, is_live: bool) -> LivenessResponseData {
        LivenessResponseData { index, is_live }
    }

    #[test]
    fn violators_only_match_monitored_indices() {
        let monitored: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let responses = vec![live(1, false), live(2, true), live(9, true)];
        assert_eq!(violators(&responses, &monitored), vec![2]);
    }

    #[test]
    fn no_liveness_means_no_violators() {
        let monitored: HashSet<u64> = [1].into_iter().collect();
        assert!(violators(&[live(1, false)], &monitored).is_empty());
        assert!(violators(&[], &monitored).is_empty());
    }

    #[test]
    fn registration_starts_disabled_and_bypass_enables() {
        let service = DoppelgangerService::new();
        service.register_validators([pubkey(1)], Epoch::new(10), false);
        service.register_validators([pubkey(2)], Epoch::new(10), true);

        assert_eq!(
            service.validator_status(pubkey(1)),
            DoppelgangerStatus::SigningDisabled(pubkey(1))
        );
        assert_eq!(
            service.validator_status(pubkey(2)),
            DoppelgangerStatus::SigningEnabled(pubkey(2))
        );
        assert_eq!(
            service.validator_status(pubkey(3)),
            DoppelgangerStatus::UnknownToDoppelganger(pubkey(3))
        );
        assert!(!service.all_keys_enabled());
    }

    #[test]
    fn re_registration_does_not_reset_state() {
        let service = DoppelgangerService::new();
        service.register_validators([pubkey(1)], Epoch::new(10), true);
        service.register_validators([pubkey(1)], Epoch::new(11), false);
        assert_eq!(
            service.validator_status(pubkey(1)),
            DoppelgangerStatus::SigningEnabled(pubkey(1))
        );
    }
}
