//! Wires the client together: registry, remote signer, coordinator,
//! store and the duty services, in dependency order.

pub mod cli;
pub mod config;

use beacon_node_fallback::BeaconNodeFallback;
use config::Config;
use doppelganger_service::DoppelgangerService;
use eth2::{BeaconNodeHttpClient, Timeouts};
use sensitive_url::SensitiveUrl;
use signing_method::RemoteSigner;
use slot_clock::{SlotClock, SystemTimeSlotClock};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use task_executor::TaskExecutor;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use types::{ChainSpec, Hash256, Slot};
use validator_registry::ValidatorRegistry;
use validator_services::{
    AttestationService, AttestationServiceBuilder, BlockService, BlockServiceBuilder,
    BlockServiceNotification, DutiesService, DutiesServiceBuilder, EventService,
    EventServiceBuilder, PreparationService, PreparationServiceBuilder, SyncCommitteeService,
};
use vero_validator_store::VeroValidatorStore;

type Store = VeroValidatorStore;

/// How long to wait between genesis-details fetch attempts when no beacon
/// node is reachable yet.
const GENESIS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The slot budgets honoured on shutdown.
const SHUTDOWN_PROPOSAL_LOOKAHEAD_SLOTS: u64 = 3;

/// The process-exit delay for the deferred shutdown: up to three slots
/// when a proposal is imminent, plus one and a half slots for in-flight
/// attester and sync duties either way.
pub fn shutdown_budget(proposal_imminent: bool, slot_duration: Duration) -> Duration {
    let attester_budget = slot_duration + slot_duration / 2;
    if proposal_imminent {
        slot_duration * SHUTDOWN_PROPOSAL_LOOKAHEAD_SLOTS as u32 + attester_budget
    } else {
        attester_budget
    }
}

pub struct ProductionValidatorClient {
    pub config: Config,
    executor: TaskExecutor,
    slot_clock: SystemTimeSlotClock,
    spec: Arc<ChainSpec>,
    duties_service: Arc<DutiesService<Store, SystemTimeSlotClock>>,
    event_service: EventService<Store, SystemTimeSlotClock>,
    attestation_service: AttestationService<Store, SystemTimeSlotClock>,
    block_service: BlockService<Store, SystemTimeSlotClock>,
    sync_committee_service: SyncCommitteeService<Store, SystemTimeSlotClock>,
    preparation_service: PreparationService<Store, SystemTimeSlotClock>,
    doppelganger_service: Option<Arc<DoppelgangerService>>,
    beacon_nodes: Arc<BeaconNodeFallback>,
    registry: Arc<ValidatorRegistry>,
    block_service_rx: Option<mpsc::Receiver<BlockServiceNotification>>,
    block_service_tx: mpsc::Sender<BlockServiceNotification>,
}

impl ProductionValidatorClient {
    pub async fn new(config: Config, executor: TaskExecutor) -> Result<Self, String> {
        let spec = Arc::new(config.spec.clone());

        // The registry comes either from the remote signer's key list or
        // from the persisted keymanager registry.
        let (registry, signer_url) = if config.enable_keymanager_api {
            let registry = ValidatorRegistry::from_remote_keys_file(&config.data_dir)
                .map_err(|e| format!("Unable to load remote key registry: {:?}", e))?;
            // The keymanager API token must exist before the collaborator
            // can serve requests.
            config::load_or_generate_api_token(&config.keymanager_api_token_file_path)?;
            let url = registry
                .remote_signer_url()
                .ok_or("No remote keys registered; add keys via the keymanager API first")?;
            let url = SensitiveUrl::from_str(&url)
                .map_err(|e| format!("Invalid signer URL in remote key registry: {}", e))?;
            (registry, url)
        } else {
            let url = config
                .remote_signer_url
                .clone()
                .ok_or("--remote-signer-url is required")?;
            (ValidatorRegistry::new(vec![]), url)
        };
        let registry = Arc::new(registry);

        let signer = Arc::new(RemoteSigner::new(signer_url, spec.interval_duration()));

        if let Err(e) = signer.upcheck().await {
            warn!(error = %e, "Remote signer did not pass its upcheck");
        }

        // In signer-discovery mode the managed set is the signer's key
        // list.
        if !config.enable_keymanager_api {
            let keys = signer
                .list_public_keys()
                .await
                .map_err(|e| format!("Unable to list remote signer keys: {}", e))?;
            if keys.is_empty() {
                return Err("The remote signer holds no keys".to_string());
            }
            info!(count = keys.len(), "Validators discovered from remote signer");
            registry.seed(keys);
        }

        let timeouts = |spec: &ChainSpec| Timeouts {
            attestation: spec.interval_duration(),
            aggregate: spec.interval_duration(),
            attester_duties: spec.slot_duration(),
            liveness: spec.slot_duration(),
            proposal: spec.interval_duration(),
            proposer_duties: spec.slot_duration(),
            sync_committee_contribution: spec.interval_duration(),
            sync_duties: spec.slot_duration(),
            default: spec.slot_duration(),
        };

        let make_clients = |urls: &[SensitiveUrl]| -> Vec<BeaconNodeHttpClient> {
            urls.iter()
                .map(|url| BeaconNodeHttpClient::new(url.clone(), timeouts(&spec)))
                .collect()
        };

        let beacon_nodes = Arc::new(BeaconNodeFallback::new(
            make_clients(&config.beacon_node_urls),
            config.attestation_consensus_threshold,
            spec.clone(),
        )?);

        let proposer_nodes = if config.proposal_node_urls.is_empty() {
            None
        } else {
            // Proposal-only nodes never take part in attestation
            // consensus, so a threshold of one is sufficient.
            Some(Arc::new(BeaconNodeFallback::new(
                make_clients(&config.proposal_node_urls),
                1,
                spec.clone(),
            )?))
        };

        beacon_nodes
            .check_spec_compatibility(config.ignore_spec_mismatch)
            .await;
        if beacon_nodes.num_enabled() == 0 {
            return Err(
                "No usable beacon nodes: every configured node reports an incompatible spec"
                    .to_string(),
            );
        }
        if let Some(proposer_nodes) = &proposer_nodes {
            proposer_nodes
                .check_spec_compatibility(config.ignore_spec_mismatch)
                .await;
        }

        let (genesis_time, genesis_validators_root) =
            wait_for_genesis(&beacon_nodes).await?;
        let slot_clock = SystemTimeSlotClock::new(
            Slot::new(0),
            Duration::from_secs(genesis_time),
            spec.slot_duration(),
        );

        let doppelganger_service = config
            .enable_doppelganger_detection
            .then(|| Arc::new(DoppelgangerService::new()));

        if let (Some(service), Some(slot)) = (&doppelganger_service, slot_clock.now()) {
            service.register_validators(
                registry.pubkeys(),
                slot.epoch(spec.slots_per_epoch),
                false,
            );
            info!("Doppelganger detection enabled; duties are paused for three epochs");
        }

        let store = Arc::new(VeroValidatorStore::new(
            registry.clone(),
            signer,
            doppelganger_service.clone(),
            validator_store::SlashingLatch::new(),
            spec.clone(),
            genesis_validators_root,
            vero_validator_store::Config {
                default_fee_recipient: config.fee_recipient,
                default_gas_limit: config.gas_limit,
                default_graffiti: config.graffiti,
                use_external_builder: config.use_external_builder,
                builder_boost_factor: config.builder_boost_factor,
            },
        ));

        let duties_service = Arc::new(
            DutiesServiceBuilder::new()
                .validator_store(store.clone())
                .slot_clock(slot_clock.clone())
                .beacon_nodes(beacon_nodes.clone())
                .registry(registry.clone())
                .executor(executor.clone())
                .spec(spec.clone())
                .build()?,
        );

        let event_service = EventServiceBuilder::new()
            .duties_service(duties_service.clone())
            .slot_clock(slot_clock.clone())
            .beacon_nodes(beacon_nodes.clone())
            .executor(executor.clone())
            .spec(spec.clone())
            .slashing_detection_enabled(!config.disable_slashing_detection)
            .build()?;

        let head_tracker = event_service.head_tracker();

        let attestation_service = AttestationServiceBuilder::new()
            .duties_service(duties_service.clone())
            .validator_store(store.clone())
            .slot_clock(slot_clock.clone())
            .beacon_nodes(beacon_nodes.clone())
            .executor(executor.clone())
            .chain_spec(spec.clone())
            .head_tracker(head_tracker.clone())
            .build()?;

        let block_service = BlockServiceBuilder::new()
            .validator_store(store.clone())
            .slot_clock(slot_clock.clone())
            .beacon_nodes(beacon_nodes.clone())
            .proposer_nodes(proposer_nodes)
            .executor(executor.clone())
            .chain_spec(spec.clone())
            .graffiti(config.graffiti)
            .build()?;

        let sync_committee_service = SyncCommitteeService::new(
            duties_service.clone(),
            store.clone(),
            slot_clock.clone(),
            beacon_nodes.clone(),
            head_tracker,
            executor.clone(),
        );

        let preparation_service = PreparationServiceBuilder::new()
            .validator_store(store.clone())
            .slot_clock(slot_clock.clone())
            .beacon_nodes(beacon_nodes.clone())
            .executor(executor.clone())
            .spec(spec.clone())
            .use_external_builder(config.use_external_builder)
            .build()?;

        let (block_service_tx, block_service_rx) = mpsc::channel(4);

        Ok(Self {
            config,
            executor,
            slot_clock,
            spec,
            duties_service,
            event_service,
            attestation_service,
            block_service,
            sync_committee_service,
            preparation_service,
            doppelganger_service,
            beacon_nodes,
            registry,
            block_service_rx: Some(block_service_rx),
            block_service_tx,
        })
    }

    pub fn start_services(&mut self) -> Result<(), String> {
        let block_service_rx = self
            .block_service_rx
            .take()
            .ok_or("Services already started")?;

        self.duties_service
            .clone()
            .start_update_service(self.block_service_tx.clone());
        self.event_service.clone().start_update_service()?;

        let head_rx = self.event_service.subscribe_heads();
        self.attestation_service
            .clone()
            .start_update_service(head_rx)?;
        self.block_service
            .clone()
            .start_update_service(block_service_rx)?;
        self.sync_committee_service.clone().start_update_service()?;
        self.preparation_service.clone().start_update_service()?;

        if let Some(service) = &self.doppelganger_service {
            service.clone().start_update_service(
                self.executor.clone(),
                self.beacon_nodes.clone(),
                self.registry.clone(),
                self.slot_clock.clone(),
                self.spec.clone(),
            );
        }

        info!(
            beacon_nodes = self.beacon_nodes.num_total(),
            threshold = self.beacon_nodes.threshold(),
            validators = self.registry.num_validators(),
            network = self.spec.config_name,
            "Validator client started"
        );
        Ok(())
    }

    /// The delay to honour before exiting, per the deferred-shutdown
    /// rules.
    pub fn deferred_shutdown_delay(&self) -> Duration {
        let proposal_imminent = self
            .slot_clock
            .now()
            .map(|slot| {
                self.duties_service
                    .proposal_imminent(slot, SHUTDOWN_PROPOSAL_LOOKAHEAD_SLOTS)
            })
            .unwrap_or(false);
        shutdown_budget(proposal_imminent, self.spec.slot_duration())
    }
}

/// Fetches genesis details through the coordinator, retrying until a node
/// responds.
async fn wait_for_genesis(
    beacon_nodes: &BeaconNodeFallback,
) -> Result<(u64, Hash256), String> {
    loop {
        match beacon_nodes
            .first_success(|client| async move { client.get_beacon_genesis().await })
            .await
        {
            Ok(response) => {
                info!(
                    genesis_time = response.data.genesis_time,
                    "Connected to beacon node(s)"
                );
                return Ok((
                    response.data.genesis_time,
                    response.data.genesis_validators_root,
                ));
            }
            Err(e) => {
                error!(error = %e, "Unable to fetch genesis details; retrying");
                sleep(GENESIS_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_budget_honours_proposals() {
        let slot = Duration::from_secs(12);
        assert_eq!(shutdown_budget(false, slot), Duration::from_secs(18));
        assert_eq!(shutdown_budget(true, slot), Duration::from_secs(54));
    }

    #[test]
    fn shutdown_budget_scales_with_slot_time() {
        let slot = Duration::from_secs(5);
        assert_eq!(
            shutdown_budget(false, slot),
            Duration::from_millis(7500),
            "gnosis slots shorten the budget"
        );
    }
}
