use beacon_node_fallback::{ApiTopic, BeaconNodeFallback, Errors};
use eth2::types::{ProduceBlockV3Data, ProduceBlockV3Response};
use eth2::StatusCode;
use logging::crit;
use slot_clock::SlotClock;
use std::ops::Deref;
use std::sync::Arc;
use task_executor::TaskExecutor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use types::{
    ChainSpec, Graffiti, PublicKeyBytes, SignedBeaconBlock, SignedBlindedBeaconBlock,
    SignedBlockContents, Slot,
};
use validator_store::{Error as ValidatorStoreError, SigningRole, ValidatorStore};

#[derive(Debug)]
pub enum BlockError {
    /// A recoverable error that can be retried, as the validator has not signed anything.
    Recoverable(String),
    /// An irrecoverable error has occurred during block proposal and should not be retried, as a
    /// block may have already been signed.
    Irrecoverable(String),
}

impl From<Errors<eth2::Error>> for BlockError {
    fn from(e: Errors<eth2::Error>) -> Self {
        BlockError::Recoverable(e.to_string())
    }
}

/// Builds a `BlockService`.
pub struct BlockServiceBuilder<S, T> {
    validator_store: Option<Arc<S>>,
    slot_clock: Option<Arc<T>>,
    beacon_nodes: Option<Arc<BeaconNodeFallback>>,
    proposer_nodes: Option<Arc<BeaconNodeFallback>>,
    executor: Option<TaskExecutor>,
    chain_spec: Option<Arc<ChainSpec>>,
    graffiti: Option<Graffiti>,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> BlockServiceBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            validator_store: None,
            slot_clock: None,
            beacon_nodes: None,
            proposer_nodes: None,
            executor: None,
            chain_spec: None,
            graffiti: None,
        }
    }

    pub fn validator_store(mut self, store: Arc<S>) -> Self {
        self.validator_store = Some(store);
        self
    }

    pub fn slot_clock(mut self, slot_clock: T) -> Self {
        self.slot_clock = Some(Arc::new(slot_clock));
        self
    }

    pub fn beacon_nodes(mut self, beacon_nodes: Arc<BeaconNodeFallback>) -> Self {
        self.beacon_nodes = Some(beacon_nodes);
        self
    }

    pub fn proposer_nodes(mut self, proposer_nodes: Option<Arc<BeaconNodeFallback>>) -> Self {
        self.proposer_nodes = proposer_nodes;
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

    pub fn graffiti(mut self, graffiti: Option<Graffiti>) -> Self {
        self.graffiti = graffiti;
        self
    }

    pub fn build(self) -> Result<BlockService<S, T>, String> {
        Ok(BlockService {
            inner: Arc::new(Inner {
                validator_store: self
                    .validator_store
                    .ok_or("Cannot build BlockService without validator_store")?,
                slot_clock: self
                    .slot_clock
                    .ok_or("Cannot build BlockService without slot_clock")?,
                beacon_nodes: self
                    .beacon_nodes
                    .ok_or("Cannot build BlockService without beacon_node")?,
                executor: self
                    .executor
                    .ok_or("Cannot build BlockService without executor")?,
                chain_spec: self
                    .chain_spec
                    .ok_or("Cannot build BlockService without chain_spec")?,
                proposer_nodes: self.proposer_nodes,
                graffiti: self.graffiti,
            }),
        })
    }
}

/// Helper to minimise `Arc` usage.
pub struct Inner<S, T> {
    validator_store: Arc<S>,
    slot_clock: Arc<T>,
    pub beacon_nodes: Arc<BeaconNodeFallback>,
    pub proposer_nodes: Option<Arc<BeaconNodeFallback>>,
    executor: TaskExecutor,
    chain_spec: Arc<ChainSpec>,
    graffiti: Option<Graffiti>,
}

/// Attempts to produce blocks for any managed proposer, notified by the
/// duties service at the start of each slot.
pub struct BlockService<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for BlockService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> Deref for BlockService<S, T> {
    type Target = Inner<S, T>;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

/// Notification from the duties service that we should try to produce a block.
pub struct BlockServiceNotification {
    pub slot: Slot,
    pub block_proposers: Vec<PublicKeyBytes>,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> BlockService<S, T> {
    pub fn start_update_service(
        self,
        mut notification_rx: mpsc::Receiver<BlockServiceNotification>,
    ) -> Result<(), String> {
        info!("Block production service started");

        let executor = self.inner.executor.clone();

        executor.spawn(
            async move {
                while let Some(notif) = notification_rx.recv().await {
                    self.do_update(notif).await.ok();
                }
                debug!("Block service shutting down");
            },
            "block_service",
        );

        Ok(())
    }

    /// Attempt to produce a block for any block producers in the notification.
    async fn do_update(&self, notification: BlockServiceNotification) -> Result<(), ()> {
        let _timer = metrics::start_timer_vec(
            &validator_metrics::BLOCK_SERVICE_TIMES,
            &[validator_metrics::FULL_UPDATE],
        );

        let slot = self.slot_clock.now().ok_or_else(move || {
            crit!("Block service failed to read slot clock");
        })?;

        if notification.slot != slot {
            warn!(
                current_slot = slot.as_u64(),
                notification_slot = notification.slot.as_u64(),
                info = "Your machine could be overloaded",
                "Skipping block production for expired slot"
            );
            return Ok(());
        }

        if slot == 0 {
            debug!("Not producing block at genesis slot");
            return Ok(());
        }

        trace!(slot = slot.as_u64(), "Block service update started");

        let proposers = notification.block_proposers;

        if proposers.is_empty() {
            trace!(
                slot = slot.as_u64(),
                "No local block proposers for this slot"
            )
        } else if proposers.len() > 1 {
            error!(
                action = "producing blocks for all proposers",
                num_proposers = proposers.len(),
                slot = slot.as_u64(),
                "Multiple block proposers for this slot"
            )
        }

        for validator_pubkey in proposers {
            if self.validator_store.slashing_latch().is_set() {
                warn!(
                    slot = slot.as_u64(),
                    "Skipping block proposal: slashing detected"
                );
                return Ok(());
            }
            let service = self.clone();
            self.inner.executor.spawn(
                async move {
                    let result = service.publish_block(slot, validator_pubkey).await;

                    match result {
                        Ok(_) => {}
                        Err(BlockError::Recoverable(e)) | Err(BlockError::Irrecoverable(e)) => {
                            error!(
                                error = ?e,
                                block_slot = ?slot,
                                info = "block proposal failed, this error may or may not result in a missed block",
                                "Error whilst producing block"
                            );
                        }
                    }
                },
                "block service",
            )
        }
        Ok(())
    }

    /// The node set allowed to produce and receive this proposal.
    fn proposal_nodes(&self) -> &Arc<BeaconNodeFallback> {
        self.proposer_nodes.as_ref().unwrap_or(&self.beacon_nodes)
    }

    async fn publish_block(
        self,
        slot: Slot,
        validator_pubkey: PublicKeyBytes,
    ) -> Result<(), BlockError> {
        let _timer = metrics::start_timer_vec(
            &validator_metrics::BLOCK_SERVICE_TIMES,
            &[validator_metrics::BEACON_BLOCK],
        );

        let proposal_data = self
            .validator_store
            .proposal_data(&validator_pubkey)
            .ok_or_else(|| {
                BlockError::Recoverable("Missing proposal data for validator".to_string())
            })?;

        let randao_reveal = match self
            .validator_store
            .randao_reveal(
                validator_pubkey,
                slot.epoch(self.chain_spec.slots_per_epoch),
            )
            .await
        {
            Ok(signature) => signature,
            Err(ValidatorStoreError::UnknownPubkey(pubkey)) => {
                // A pubkey can be missing when a validator was recently
                // removed via the keymanager.
                warn!(?pubkey, ?slot, "Missing pubkey for block randao");
                return Ok(());
            }
            Err(e) => {
                return Err(BlockError::Recoverable(format!(
                    "Unable to produce randao reveal signature: {:?}",
                    e
                )))
            }
        };

        let graffiti = self
            .validator_store
            .graffiti(&validator_pubkey)
            .or(self.graffiti);

        info!(slot = slot.as_u64(), "Requesting unsigned block");

        // Race every proposal-allowed node and keep the highest-value
        // block. Cut the race at 1/3 of the slot so signing and
        // publication still land early.
        let deadline = Instant::now() + self.slot_clock.slot_duration() / 3;
        let block_response = self
            .proposal_nodes()
            .best_block(
                slot,
                randao_reveal,
                graffiti,
                proposal_data.builder_boost_factor,
                deadline,
            )
            .await
            .map_err(|e| {
                BlockError::Recoverable(format!(
                    "Error from beacon nodes when producing block: {}",
                    e
                ))
            })?;

        info!(
            slot = slot.as_u64(),
            blinded = block_response.execution_payload_blinded(),
            execution_payload_value = %block_response.execution_payload_value,
            consensus_block_value = %block_response.consensus_block_value,
            "Received unsigned block"
        );

        if proposal_data.validator_index != Some(block_response.proposer_index()) {
            return Err(BlockError::Recoverable(
                "Proposer index does not match block proposer. Beacon chain re-orged".to_string(),
            ));
        }

        self.sign_and_publish_block(slot, validator_pubkey, block_response)
            .await
    }

    async fn sign_and_publish_block(
        &self,
        slot: Slot,
        validator_pubkey: PublicKeyBytes,
        block_response: ProduceBlockV3Response,
    ) -> Result<(), BlockError> {
        let signing_timer = Instant::now();
        let fork_name = self
            .chain_spec
            .fork_name_at_epoch(slot.epoch(self.chain_spec.slots_per_epoch));

        // Sign over the header; the body root commits to the exact block
        // being proposed.
        let header = match &block_response.data {
            ProduceBlockV3Data::Full(contents) => contents.block.block_header(),
            ProduceBlockV3Data::Blinded(block) => block.block_header(),
        };

        let signature = match self
            .validator_store
            .sign_block(validator_pubkey, header, slot)
            .await
        {
            Ok(signature) => signature,
            Err(ValidatorStoreError::UnknownPubkey(pubkey)) => {
                warn!(?pubkey, ?slot, "Missing pubkey for block");
                return Ok(());
            }
            Err(ValidatorStoreError::SlashingDetected) => {
                warn!(?slot, "Block not signed: slashing detected");
                return Ok(());
            }
            Err(e) => {
                return Err(BlockError::Recoverable(format!(
                    "Unable to sign block: {:?}",
                    e
                )))
            }
        };

        let signing_time_ms = signing_timer.elapsed().as_millis();
        info!(
            slot = slot.as_u64(),
            signing_time_ms = signing_time_ms,
            "Publishing signed block"
        );

        let submission_timer = Instant::now();
        match block_response.data {
            ProduceBlockV3Data::Full(contents) => {
                let contents = SignedBlockContents {
                    signed_block: SignedBeaconBlock {
                        message: contents.block,
                        signature,
                    },
                    kzg_proofs: contents.kzg_proofs,
                    blobs: contents.blobs,
                };
                let contents_ref = &contents;
                self.proposal_nodes()
                    .request(ApiTopic::Blocks, |beacon_node| async move {
                        let _timer = metrics::start_timer_vec(
                            &validator_metrics::BLOCK_SERVICE_TIMES,
                            &[validator_metrics::BEACON_BLOCK_HTTP_POST],
                        );
                        publish_full_block(&beacon_node, contents_ref, fork_name).await
                    })
                    .await
                    .map_err(|e| BlockError::Irrecoverable(e.to_string()))?;
            }
            ProduceBlockV3Data::Blinded(block) => {
                let block = SignedBlindedBeaconBlock {
                    message: *block,
                    signature,
                };
                let block_ref = &block;
                self.proposal_nodes()
                    .request(ApiTopic::Blocks, |beacon_node| async move {
                        let _timer = metrics::start_timer_vec(
                            &validator_metrics::BLOCK_SERVICE_TIMES,
                            &[validator_metrics::BEACON_BLOCK_HTTP_POST],
                        );
                        publish_blinded_block(&beacon_node, block_ref, fork_name).await
                    })
                    .await
                    .map_err(|e| BlockError::Irrecoverable(e.to_string()))?;
            }
        }

        metrics::observe_vec(
            &validator_metrics::DUTY_SUBMISSION_TIME,
            &[SigningRole::Block.as_str()],
            submission_timer.elapsed().as_secs_f64(),
        );

        info!(
            graffiti = ?self.graffiti.map(|g| g.as_utf8_lossy()),
            slot = slot.as_u64(),
            "Successfully published block"
        );
        Ok(())
    }
}

/// Publishes SSZ-first with a JSON fallback for beacon nodes that reject
/// the octet-stream body.
async fn publish_full_block(
    beacon_node: &eth2::BeaconNodeHttpClient,
    contents: &SignedBlockContents,
    fork_name: &str,
) -> Result<(), eth2::Error> {
    match beacon_node.post_beacon_blocks_v2_ssz(contents, fork_name).await {
        Ok(()) => Ok(()),
        Err(e) if e.status() == Some(StatusCode::UNSUPPORTED_MEDIA_TYPE) => {
            debug!("Beacon node rejected SSZ block body; retrying as JSON");
            beacon_node.post_beacon_blocks_v2(contents, fork_name).await
        }
        Err(e) => match handle_block_post_error(&e) {
            Some(()) => Ok(()),
            None => Err(e),
        },
    }
}

async fn publish_blinded_block(
    beacon_node: &eth2::BeaconNodeHttpClient,
    block: &SignedBlindedBeaconBlock,
    fork_name: &str,
) -> Result<(), eth2::Error> {
    match beacon_node
        .post_beacon_blinded_blocks_v2_ssz(block, fork_name)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.status() == Some(StatusCode::UNSUPPORTED_MEDIA_TYPE) => {
            debug!("Beacon node rejected SSZ block body; retrying as JSON");
            beacon_node
                .post_beacon_blinded_blocks_v2(block, fork_name)
                .await
        }
        Err(e) => match handle_block_post_error(&e) {
            Some(()) => Ok(()),
            None => Err(e),
        },
    }
}

/// Handle non-200 success codes: 202 means the block is already known to
/// the node or may be invalid, which is not a publication failure.
fn handle_block_post_error(err: &eth2::Error) -> Option<()> {
    let status = err.status()?;
    if status == StatusCode::ACCEPTED {
        info!(
            status_code = status.as_u16(),
            "Block is already known to BN or might be invalid"
        );
        Some(())
    } else if status.is_success() {
        debug!(
            status_code = status.as_u16(),
            "Block published with non-standard success code"
        );
        Some(())
    } else {
        None
    }
}
