use beacon_node_fallback::BeaconNodeFallback;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};
use types::{ChainSpec, Epoch, SyncDuty};
use validator_registry::ValidatorRegistry;

/// How many epochs before a sync-committee period boundary we begin
/// fetching the next period's duties.
const PRE_PERIOD_LOOKAHEAD_EPOCHS: u64 = 4;

/// Sync duties keyed by sync-committee period.
///
/// Unlike attester duties these are stable for an entire period, so the
/// map is small and refreshed only at (or just before) period boundaries.
#[derive(Default)]
pub struct SyncDutiesMap {
    periods: RwLock<HashMap<u64, Vec<SyncDuty>>>,
}

impl SyncDutiesMap {
    /// The duties active for `epoch`.
    pub fn duties_for_epoch(&self, epoch: Epoch, spec: &ChainSpec) -> Vec<SyncDuty> {
        let period = epoch.sync_committee_period(spec.epochs_per_sync_committee_period);
        self.periods
            .read()
            .get(&period)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetches duties for the current period (and the next one when the
    /// boundary is close) for any period not yet cached.
    pub async fn poll(
        &self,
        beacon_nodes: &BeaconNodeFallback,
        registry: &ValidatorRegistry,
        current_epoch: Epoch,
        spec: &ChainSpec,
    ) -> Result<(), String> {
        let indices = registry.indices();
        if indices.is_empty() {
            return Ok(());
        }

        let period_len = spec.epochs_per_sync_committee_period;
        let current_period = current_epoch.sync_committee_period(period_len);
        let mut wanted = vec![current_period];
        if (current_epoch + PRE_PERIOD_LOOKAHEAD_EPOCHS).sync_committee_period(period_len)
            != current_period
        {
            wanted.push(current_period + 1);
        }

        for period in wanted {
            if self.periods.read().contains_key(&period) {
                continue;
            }
            // Duties are requested at the first epoch of the period, which
            // uniquely identifies the committee.
            let epoch = Epoch::new(period * period_len);
            let duties = beacon_nodes
                .first_success(|client| {
                    let indices = indices.clone();
                    async move {
                        client
                            .post_validator_duties_sync(epoch, &indices)
                            .await
                            .map(|response| response.data)
                    }
                })
                .await
                .map_err(|e| format!("Failed to download sync duties: {}", e))?;

            if !duties.is_empty() {
                info!(
                    period,
                    count = duties.len(),
                    "Validators in sync committee"
                );
            } else {
                debug!(period, "No managed validators in sync committee");
            }
            self.periods.write().insert(period, duties);
        }
        Ok(())
    }

    pub fn prune(&self, current_epoch: Epoch, spec: &ChainSpec) {
        let current_period =
            current_epoch.sync_committee_period(spec.epochs_per_sync_committee_period);
        self.periods
            .write()
            .retain(|period, _| *period + 1 >= current_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::PublicKeyBytes;

    fn duty(index: u64) -> SyncDuty {
        SyncDuty {
            pubkey: PublicKeyBytes::empty(),
            validator_index: index,
            validator_sync_committee_indices: vec![0],
        }
    }

    #[test]
    fn duties_resolve_by_period() {
        let spec = ChainSpec::mainnet();
        let map = SyncDutiesMap::default();
        map.periods.write().insert(1, vec![duty(5)]);

        // Period 1 covers epochs [256, 512).
        assert_eq!(map.duties_for_epoch(Epoch::new(256), &spec).len(), 1);
        assert_eq!(map.duties_for_epoch(Epoch::new(511), &spec).len(), 1);
        assert!(map.duties_for_epoch(Epoch::new(512), &spec).is_empty());
    }

    #[test]
    fn prune_keeps_previous_period() {
        let spec = ChainSpec::mainnet();
        let map = SyncDutiesMap::default();
        map.periods.write().insert(0, vec![]);
        map.periods.write().insert(1, vec![]);
        map.periods.write().insert(2, vec![]);

        // Current epoch in period 2.
        map.prune(Epoch::new(520), &spec);
        let periods = map.periods.read();
        assert!(!periods.contains_key(&0));
        assert!(periods.contains_key(&1));
        assert!(periods.contains_key(&2));
    }
}
