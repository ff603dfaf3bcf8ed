use beacon_node_fallback::BeaconNodeFallback;
use slot_clock::SlotClock;
use std::ops::Deref;
use std::sync::Arc;
use task_executor::TaskExecutor;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use types::{ChainSpec, SignedValidatorRegistrationData, ValidatorRegistrationData};
use validator_store::{DoppelgangerStatus, Error as ValidatorStoreError, ValidatorStore};

/// Builds a `PreparationService`.
pub struct PreparationServiceBuilder<S, T> {
    validator_store: Option<Arc<S>>,
    slot_clock: Option<T>,
    beacon_nodes: Option<Arc<BeaconNodeFallback>>,
    executor: Option<TaskExecutor>,
    spec: Option<Arc<ChainSpec>>,
    use_external_builder: bool,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> PreparationServiceBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            validator_store: None,
            slot_clock: None,
            beacon_nodes: None,
            executor: None,
            spec: None,
            use_external_builder: false,
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

    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn spec(mut self, spec: Arc<ChainSpec>) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn use_external_builder(mut self, use_external_builder: bool) -> Self {
        self.use_external_builder = use_external_builder;
        self
    }

    pub fn build(self) -> Result<PreparationService<S, T>, String> {
        Ok(PreparationService {
            inner: Arc::new(Inner {
                validator_store: self
                    .validator_store
                    .ok_or("Cannot build PreparationService without validator_store")?,
                slot_clock: self
                    .slot_clock
                    .ok_or("Cannot build PreparationService without slot_clock")?,
                beacon_nodes: self
                    .beacon_nodes
                    .ok_or("Cannot build PreparationService without beacon_nodes")?,
                executor: self
                    .executor
                    .ok_or("Cannot build PreparationService without executor")?,
                spec: self
                    .spec
                    .ok_or("Cannot build PreparationService without spec")?,
                use_external_builder: self.use_external_builder,
            }),
        })
    }
}

pub struct Inner<S, T> {
    validator_store: Arc<S>,
    slot_clock: T,
    beacon_nodes: Arc<BeaconNodeFallback>,
    executor: TaskExecutor,
    spec: Arc<ChainSpec>,
    use_external_builder: bool,
}

/// Signs and publishes validator registrations for external builders once
/// per epoch. Without `--use-external-builder` the service never starts.
pub struct PreparationService<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for PreparationService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> Deref for PreparationService<S, T> {
    type Target = Inner<S, T>;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> PreparationService<S, T> {
    pub fn start_update_service(self) -> Result<(), String> {
        if !self.use_external_builder {
            debug!("Validator registration disabled (no external builder)");
            return Ok(());
        }

        info!("Validator registration service started");

        let executor = self.executor.clone();
        executor.spawn(
            async move {
                loop {
                    self.register_validators().await;
                    match self
                        .slot_clock
                        .duration_to_next_epoch(self.spec.slots_per_epoch)
                    {
                        Some(duration) => sleep(duration).await,
                        None => sleep(self.spec.epoch_duration()).await,
                    }
                }
            },
            "preparation_service",
        );
        Ok(())
    }

    /// Builds, signs and publishes a registration for every key cleared to
    /// sign.
    async fn register_validators(&self) {
        if self.validator_store.slashing_latch().is_set() {
            warn!("Skipping validator registration: slashing detected");
            return;
        }

        let timestamp = match self.slot_clock.now_duration() {
            Some(now) => now.as_secs(),
            None => {
                error!("Unable to read clock for validator registration");
                return;
            }
        };

        let pubkeys: Vec<_> = self
            .validator_store
            .voting_pubkeys::<Vec<_>, _>(DoppelgangerStatus::only_safe);

        let mut registrations: Vec<SignedValidatorRegistrationData> = vec![];
        for pubkey in pubkeys {
            let Some(proposal_data) = self.validator_store.proposal_data(&pubkey) else {
                continue;
            };
            let Some(fee_recipient) = proposal_data.fee_recipient else {
                warn!(
                    ?pubkey,
                    "No fee recipient configured; skipping builder registration"
                );
                continue;
            };

            let registration = ValidatorRegistrationData {
                fee_recipient,
                gas_limit: proposal_data.gas_limit,
                timestamp,
                pubkey,
            };

            match self
                .validator_store
                .sign_validator_registration_data(registration)
                .await
            {
                Ok(signed) => registrations.push(signed),
                Err(ValidatorStoreError::SlashingDetected) => {
                    warn!("Registration signing stopped: slashing detected");
                    return;
                }
                Err(e) => {
                    error!(error = ?e, ?pubkey, "Unable to sign validator registration");
                }
            }
        }

        if registrations.is_empty() {
            return;
        }

        let registrations_slice = registrations.as_slice();
        match self
            .beacon_nodes
            .first_success(|beacon_node| async move {
                beacon_node
                    .post_validator_register_validator(registrations_slice)
                    .await
            })
            .await
        {
            Ok(()) => info!(
                count = registrations.len(),
                "Published validator registrations"
            ),
            Err(e) => error!(error = %e, "Unable to publish validator registrations"),
        }
    }
}
