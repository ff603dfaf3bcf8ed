//! The multi-beacon-node coordinator.
//!
//! Every read the client signs over is cross-checked here. Reads that feed
//! signatures (attestation data, finality checkpoints) require agreement
//! from at least `threshold` beacon nodes; best-of reads (aggregates,
//! blocks) race every node and keep the best timely response; routine
//! operations go to the healthiest node and fail over down the list.

pub mod quorum;

use eth2::types::{
    AttestationData, Attestation, ChainSpec, Checkpoint, Epoch, Graffiti, Hash256,
    ProduceBlockV3Response, SignatureBytes, Slot, StateId, SyncCommitteeContribution,
};
use eth2::{BeaconNodeHttpClient, Error as Eth2Error};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use ssz::Encode;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Scores live in `[MIN_SCORE, MAX_SCORE]`; a fresh node starts at max.
const MAX_SCORE: i64 = 100;
const MIN_SCORE: i64 = 0;

/// The outcome of one call to a beacon node, ordered worst-first so that
/// `Ord` ranks healthier outcomes higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    ConnectionRefused,
    ServerError,
    Timeout,
    SlowSuccess,
    Success,
}

impl Outcome {
    /// The score adjustment for this outcome. Successes never decrease the
    /// score, so scoring is monotone under success.
    fn score_delta(&self) -> i64 {
        match self {
            Outcome::Success => 2,
            Outcome::SlowSuccess => 1,
            Outcome::Timeout => -8,
            Outcome::ServerError => -15,
            Outcome::ConnectionRefused => -25,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BeaconNodeHealth {
    pub score: i64,
    pub last_outcome: Outcome,
}

impl BeaconNodeHealth {
    /// Nodes order by last outcome class first, then score. Ties beyond
    /// that fall back to configuration order in the caller.
    fn ranking_key(&self) -> (Outcome, i64) {
        (self.last_outcome, self.score)
    }
}

/// One beacon node and its health state. The health is only written by the
/// task performing a call on this candidate, so a lock is held only for
/// the length of the update.
pub struct CandidateBeaconNode {
    index: usize,
    client: BeaconNodeHttpClient,
    health: RwLock<BeaconNodeHealth>,
    enabled: AtomicBool,
}

impl fmt::Display for CandidateBeaconNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client)
    }
}

impl CandidateBeaconNode {
    pub fn new(client: BeaconNodeHttpClient, index: usize) -> Self {
        Self {
            index,
            client,
            health: RwLock::new(BeaconNodeHealth {
                score: MAX_SCORE,
                last_outcome: Outcome::Success,
            }),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn client(&self) -> &BeaconNodeHttpClient {
        &self.client
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn health(&self) -> BeaconNodeHealth {
        *self.health.read()
    }

    pub fn score(&self) -> i64 {
        self.health.read().score
    }

    fn record_outcome(&self, outcome: Outcome) {
        let mut health = self.health.write();
        health.score = (health.score + outcome.score_delta()).clamp(MIN_SCORE, MAX_SCORE);
        health.last_outcome = outcome;
        let score = health.score;
        drop(health);

        metrics::set_gauge_vec(
            &validator_metrics::BEACON_NODE_SCORE,
            &[&self.client.to_string()],
            score,
        );
    }

    /// Runs `f` against this node's client, classifying the outcome for
    /// scoring. A success slower than `slow_cutoff` still succeeds, but
    /// ranks below a prompt one.
    pub async fn perform<F, Fut, O>(&self, slow_cutoff: Duration, f: F) -> Result<O, Eth2Error>
    where
        F: FnOnce(BeaconNodeHttpClient) -> Fut,
        Fut: Future<Output = Result<O, Eth2Error>>,
    {
        let start = Instant::now();
        let result = f(self.client.clone()).await;
        let elapsed = start.elapsed();

        let outcome = match &result {
            Ok(_) if elapsed <= slow_cutoff => Outcome::Success,
            Ok(_) => Outcome::SlowSuccess,
            Err(e) if e.is_timeout() => Outcome::Timeout,
            Err(e) if e.is_connect() => Outcome::ConnectionRefused,
            Err(_) => Outcome::ServerError,
        };
        self.record_outcome(outcome);

        result
    }
}

/// The operation classes used for logging and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ApiTopic {
    Attestations,
    Blocks,
    Subscriptions,
    SyncCommittee,
}

/// The errors collected while trying an operation across nodes.
pub struct Errors<E>(pub Vec<(String, E)>);

impl<E: fmt::Debug> fmt::Display for Errors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_empty() {
            write!(f, "Some endpoints failed, num_failed: {}", self.0.len())?;
        }
        for (node, error) in &self.0 {
            write!(f, " {} => {:?},", node, error)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug> fmt::Debug for Errors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, PartialEq)]
pub enum QuorumError {
    /// No enabled beacon nodes remain.
    NoCandidates,
    /// Fewer than `threshold` live responses agreed before the deadline.
    Unreachable { votes: usize, threshold: usize },
}

impl fmt::Display for QuorumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumError::NoCandidates => write!(f, "no enabled beacon nodes"),
            QuorumError::Unreachable { votes, threshold } => write!(
                f,
                "agreement unreachable: {} votes against threshold {}",
                votes, threshold
            ),
        }
    }
}

struct ConfirmedCheckpoints {
    epoch: Epoch,
    source: Checkpoint,
    finalized: Checkpoint,
}

/// Routes requests to one or many beacon nodes.
pub struct BeaconNodeFallback {
    candidates: Vec<Arc<CandidateBeaconNode>>,
    /// The number of beacon nodes that must agree before attestation data
    /// is signed. Fixed for the process lifetime, in `[1, N]`.
    threshold: usize,
    spec: Arc<ChainSpec>,
    checkpoint_cache: RwLock<Option<ConfirmedCheckpoints>>,
}

impl BeaconNodeFallback {
    pub fn new(
        clients: Vec<BeaconNodeHttpClient>,
        threshold: usize,
        spec: Arc<ChainSpec>,
    ) -> Result<Self, String> {
        if clients.is_empty() {
            return Err("at least one beacon node is required".to_string());
        }
        if threshold == 0 || threshold > clients.len() {
            return Err(format!(
                "attestation consensus threshold {} must be within [1, {}]",
                threshold,
                clients.len()
            ));
        }
        let candidates = clients
            .into_iter()
            .enumerate()
            .map(|(index, client)| Arc::new(CandidateBeaconNode::new(client, index)))
            .collect();
        Ok(Self {
            candidates,
            threshold,
            spec,
            checkpoint_cache: RwLock::new(None),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn num_total(&self) -> usize {
        self.candidates.len()
    }

    pub fn num_enabled(&self) -> usize {
        self.candidates.iter().filter(|c| c.is_enabled()).count()
    }

    pub fn candidates(&self) -> &[Arc<CandidateBeaconNode>] {
        &self.candidates
    }

    /// A call slower than this still succeeds, but marks the node as slow.
    fn slow_cutoff(&self) -> Duration {
        self.spec.slot_duration() / 6
    }

    fn enabled_candidates(&self) -> Vec<Arc<CandidateBeaconNode>> {
        self.candidates
            .iter()
            .filter(|c| c.is_enabled())
            .cloned()
            .collect()
    }

    /// Enabled candidates, healthiest first. Ties are broken by
    /// configuration order.
    pub fn sorted_candidates(&self) -> Vec<Arc<CandidateBeaconNode>> {
        let mut candidates = self.enabled_candidates();
        candidates.sort_by(|a, b| {
            b.health()
                .ranking_key()
                .cmp(&a.health().ranking_key())
                .then(a.index.cmp(&b.index))
        });
        candidates
    }

    /// Verifies every node's reported spec against ours. A mismatching
    /// node is disabled, unless the operator waived the check.
    pub async fn check_spec_compatibility(&self, ignore_mismatch: bool) {
        for candidate in &self.candidates {
            let remote = match candidate
                .perform(self.slow_cutoff(), |client| async move {
                    client.get_config_spec().await
                })
                .await
            {
                Ok(response) => response.data,
                Err(e) => {
                    warn!(node = %candidate, error = %e, "Unable to fetch spec from beacon node");
                    continue;
                }
            };

            let remote: std::collections::HashMap<String, String> = remote
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect();

            let errors = self.spec.compatibility_errors(&remote);
            if errors.is_empty() {
                continue;
            }
            if ignore_mismatch {
                warn!(
                    node = %candidate,
                    mismatches = ?errors,
                    "Beacon node spec mismatch waived by operator"
                );
            } else {
                error!(
                    node = %candidate,
                    mismatches = ?errors,
                    "Beacon node runs an incompatible spec and has been disabled"
                );
                candidate.set_enabled(false);
            }
        }
    }

    /// Try `func` against each node in health order, returning the first
    /// success.
    pub async fn first_success<F, O, Fut>(&self, func: F) -> Result<O, Errors<Eth2Error>>
    where
        F: Fn(BeaconNodeHttpClient) -> Fut,
        Fut: Future<Output = Result<O, Eth2Error>>,
    {
        let mut errors = vec![];
        for candidate in self.sorted_candidates() {
            match candidate.perform(self.slow_cutoff(), &func).await {
                Ok(output) => return Ok(output),
                Err(e) => errors.push((candidate.to_string(), e)),
            }
        }
        Err(Errors(errors))
    }

    /// Post-style operations: identical fail-over semantics, with the
    /// topic recorded for diagnostics.
    pub async fn request<F, Fut>(&self, topic: ApiTopic, func: F) -> Result<(), Errors<Eth2Error>>
    where
        F: Fn(BeaconNodeHttpClient) -> Fut,
        Fut: Future<Output = Result<(), Eth2Error>>,
    {
        let result = self.first_success(func).await;
        if let Err(errors) = &result {
            debug!(%topic, %errors, "Request failed on one or more beacon nodes");
        }
        result
    }

    /// Establishes threshold agreement on attestation data for `slot`.
    ///
    /// With a `known_head` (a head event was observed for this slot),
    /// responses pinned to any other head are discarded and agreement is
    /// counted over the remaining `(source, target)` votes. Without one,
    /// responses group by the full `(head, source, target)` triple.
    ///
    /// In-flight requests are abandoned at `deadline`; responses arriving
    /// later never contribute.
    pub async fn attestation_data_consensus(
        &self,
        slot: Slot,
        committee_index: u64,
        known_head: Option<Hash256>,
        deadline: Instant,
    ) -> Result<AttestationData, QuorumError> {
        let candidates = self.enabled_candidates();
        if candidates.is_empty() {
            return Err(QuorumError::NoCandidates);
        }

        let started = Instant::now();
        let slow_cutoff = self.slow_cutoff();
        let mut requests = candidates
            .iter()
            .map(|candidate| {
                let candidate = candidate.clone();
                async move {
                    let result = candidate
                        .perform(slow_cutoff, |client| async move {
                            client
                                .get_validator_attestation_data(slot, committee_index)
                                .await
                                .map(|response| response.data)
                        })
                        .await;
                    (candidate, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut tally = quorum::AttestationDataTally::new();
        loop {
            let next = tokio::time::timeout_at(deadline, requests.next()).await;
            match next {
                // Deadline reached: in-flight requests are dropped and can
                // no longer contribute to the tally.
                Err(_) => break,
                Ok(None) => break,
                Ok(Some((candidate, result))) => {
                    let data = match result {
                        Ok(data) => data,
                        Err(e) => {
                            debug!(node = %candidate, error = %e, "Attestation data fetch failed");
                            continue;
                        }
                    };
                    if data.slot != slot {
                        warn!(node = %candidate, "Beacon node returned attestation data for the wrong slot");
                        continue;
                    }
                    if let Some(head) = known_head {
                        if !quorum::matches_known_head(&data, head) {
                            debug!(
                                node = %candidate,
                                got = ?data.beacon_block_root,
                                expected = ?head,
                                "Attestation data not pinned to known head"
                            );
                            continue;
                        }
                    }
                    if tally.add_vote(data) >= self.threshold {
                        metrics::observe(
                            &validator_metrics::ATTESTATION_CONSENSUS_TIME,
                            started.elapsed().as_secs_f64(),
                        );
                        // The winner is the first-arriving member of the
                        // group that just reached the threshold.
                        return tally
                            .winner(self.threshold)
                            .ok_or(QuorumError::NoCandidates);
                    }
                }
            }
        }

        metrics::inc_counter(&validator_metrics::ATTESTATION_CONSENSUS_FAILURES);
        Err(QuorumError::Unreachable {
            votes: tally.total_votes(),
            threshold: self.threshold,
        })
    }

    /// Confirms that `threshold` nodes agree on the justified/finalized
    /// checkpoints. The result is cached for the epoch and dropped by
    /// `invalidate_checkpoint_cache` when a reorg crosses the epoch
    /// boundary.
    pub async fn confirm_finality_checkpoints(
        &self,
        epoch: Epoch,
        deadline: Instant,
    ) -> Result<(), QuorumError> {
        if let Some(cached) = self.checkpoint_cache.read().as_ref() {
            if cached.epoch == epoch {
                return Ok(());
            }
        }

        let candidates = self.enabled_candidates();
        if candidates.is_empty() {
            return Err(QuorumError::NoCandidates);
        }

        let slow_cutoff = self.slow_cutoff();
        let mut requests = candidates
            .iter()
            .map(|candidate| {
                let candidate = candidate.clone();
                async move {
                    candidate
                        .perform(slow_cutoff, |client| async move {
                            client
                                .get_beacon_states_finality_checkpoints(StateId::Head)
                                .await
                        })
                        .await
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut votes: std::collections::HashMap<Vec<u8>, (usize, Checkpoint, Checkpoint)> =
            std::collections::HashMap::new();
        let mut total = 0;
        loop {
            match tokio::time::timeout_at(deadline, requests.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Ok(Some(response)))) => {
                    let source = response.data.current_justified;
                    let finalized = response.data.finalized;
                    let mut key = source.as_ssz_bytes();
                    key.extend(finalized.as_ssz_bytes());
                    let entry = votes.entry(key).or_insert((0, source, finalized));
                    entry.0 += 1;
                    total += 1;
                    if entry.0 >= self.threshold {
                        *self.checkpoint_cache.write() = Some(ConfirmedCheckpoints {
                            epoch,
                            source,
                            finalized,
                        });
                        return Ok(());
                    }
                }
                Ok(Some(Ok(None))) => continue,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Finality checkpoint fetch failed");
                    continue;
                }
            }
        }

        Err(QuorumError::Unreachable {
            votes: total,
            threshold: self.threshold,
        })
    }

    pub fn invalidate_checkpoint_cache(&self) {
        *self.checkpoint_cache.write() = None;
    }

    /// Fetches the matching aggregate from every node and keeps the one
    /// with the most participation bits among timely responses.
    pub async fn best_aggregate(
        &self,
        slot: Slot,
        attestation_data_root: Hash256,
        deadline: Instant,
    ) -> Result<Attestation, QuorumError> {
        let candidates = self.enabled_candidates();
        if candidates.is_empty() {
            return Err(QuorumError::NoCandidates);
        }

        let slow_cutoff = self.slow_cutoff();
        let mut requests = candidates
            .iter()
            .map(|candidate| {
                let candidate = candidate.clone();
                async move {
                    candidate
                        .perform(slow_cutoff, |client| async move {
                            client
                                .get_validator_aggregate_attestation(slot, attestation_data_root)
                                .await
                        })
                        .await
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut received = vec![];
        loop {
            match tokio::time::timeout_at(deadline, requests.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Ok(Some(response)))) => received.push(response.data),
                Ok(Some(Ok(None))) => continue,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Aggregate fetch failed");
                    continue;
                }
            }
        }

        quorum::select_best_aggregate(received).ok_or(QuorumError::Unreachable {
            votes: 0,
            threshold: 1,
        })
    }

    /// Fetches the sync contribution from every node and keeps the one
    /// with the most participation bits among timely responses.
    pub async fn best_sync_contribution(
        &self,
        slot: Slot,
        subcommittee_index: u64,
        beacon_block_root: Hash256,
        deadline: Instant,
    ) -> Result<SyncCommitteeContribution, QuorumError> {
        let candidates = self.enabled_candidates();
        if candidates.is_empty() {
            return Err(QuorumError::NoCandidates);
        }

        let slow_cutoff = self.slow_cutoff();
        let mut requests = candidates
            .iter()
            .map(|candidate| {
                let candidate = candidate.clone();
                async move {
                    candidate
                        .perform(slow_cutoff, |client| async move {
                            client
                                .get_validator_sync_committee_contribution(
                                    slot,
                                    subcommittee_index,
                                    beacon_block_root,
                                )
                                .await
                        })
                        .await
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut best: Option<SyncCommitteeContribution> = None;
        loop {
            match tokio::time::timeout_at(deadline, requests.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Ok(Some(response)))) => {
                    let contribution = response.data;
                    let better = match &best {
                        None => true,
                        Some(current) => {
                            contribution.num_set_aggregation_bits()
                                > current.num_set_aggregation_bits()
                        }
                    };
                    if better {
                        best = Some(contribution);
                    }
                }
                Ok(Some(Ok(None))) => continue,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Sync contribution fetch failed");
                    continue;
                }
            }
        }

        best.ok_or(QuorumError::Unreachable {
            votes: 0,
            threshold: 1,
        })
    }

    /// Asks every node for a block and keeps the one with the highest
    /// effective value, boosting externally-built blocks by
    /// `builder_boost_factor / 100`.
    pub async fn best_block(
        &self,
        slot: Slot,
        randao_reveal: SignatureBytes,
        graffiti: Option<Graffiti>,
        builder_boost_factor: Option<u64>,
        deadline: Instant,
    ) -> Result<ProduceBlockV3Response, QuorumError> {
        let candidates = self.enabled_candidates();
        if candidates.is_empty() {
            return Err(QuorumError::NoCandidates);
        }

        let slow_cutoff = self.slow_cutoff();
        let mut requests = candidates
            .iter()
            .map(|candidate| {
                let candidate = candidate.clone();
                let randao_reveal = randao_reveal;
                async move {
                    let result = candidate
                        .perform(slow_cutoff, |client| async move {
                            client
                                .get_validator_blocks_v3(
                                    slot,
                                    &randao_reveal,
                                    graffiti.as_ref(),
                                    builder_boost_factor,
                                )
                                .await
                        })
                        .await;
                    (candidate, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut received = vec![];
        loop {
            match tokio::time::timeout_at(deadline, requests.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some((candidate, result))) => match result {
                    Ok(response) if response.slot() == slot => received.push(response),
                    Ok(_) => {
                        warn!(node = %candidate, "Beacon node produced a block for the wrong slot")
                    }
                    Err(e) => debug!(node = %candidate, error = %e, "Block production failed"),
                },
            }
        }

        quorum::select_best_block(received, builder_boost_factor.unwrap_or(100)).ok_or(
            QuorumError::Unreachable {
                votes: 0,
                threshold: 1,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eth2::Timeouts;
    use sensitive_url::SensitiveUrl;
    use std::str::FromStr;

    fn candidate(index: usize) -> CandidateBeaconNode {
        let url = SensitiveUrl::from_str(&format!("http://localhost:{}", 5052 + index)).unwrap();
        CandidateBeaconNode::new(
            BeaconNodeHttpClient::new(url, Timeouts::set_all(Duration::from_secs(1))),
            index,
        )
    }

    #[test]
    fn outcome_ordering_matches_health_ranking() {
        assert!(Outcome::Success > Outcome::SlowSuccess);
        assert!(Outcome::SlowSuccess > Outcome::Timeout);
        assert!(Outcome::Timeout > Outcome::ServerError);
        assert!(Outcome::ServerError > Outcome::ConnectionRefused);
    }

    #[test]
    fn success_scoring_is_monotone() {
        let node = candidate(0);
        node.record_outcome(Outcome::Timeout);
        let after_timeout = node.score();
        node.record_outcome(Outcome::Success);
        assert!(node.score() >= after_timeout);
        node.record_outcome(Outcome::SlowSuccess);
        assert!(node.score() >= after_timeout);
        for _ in 0..200 {
            node.record_outcome(Outcome::Success);
        }
        assert_eq!(node.score(), MAX_SCORE);
    }

    #[test]
    fn score_clamps_at_zero() {
        let node = candidate(0);
        for _ in 0..100 {
            node.record_outcome(Outcome::ConnectionRefused);
        }
        assert_eq!(node.score(), MIN_SCORE);
    }

    #[test]
    fn ties_resolve_by_configuration_order() {
        let spec = Arc::new(ChainSpec::mainnet());
        let clients = (0..3)
            .map(|i| {
                let url =
                    SensitiveUrl::from_str(&format!("http://localhost:{}", 5052 + i)).unwrap();
                BeaconNodeHttpClient::new(url, Timeouts::set_all(Duration::from_secs(1)))
            })
            .collect();
        let fallback = BeaconNodeFallback::new(clients, 2, spec).unwrap();
        let sorted = fallback.sorted_candidates();
        assert_eq!(
            sorted.iter().map(|c| c.index()).collect::<Vec<_>>(),
            vec![0, 1, 2],
            "equal health falls back to configuration order"
        );

        // Degrade the first node; it must drop below its peers.
        fallback.candidates()[0].record_outcome(Outcome::ServerError);
        let sorted = fallback.sorted_candidates();
        assert_eq!(sorted.iter().map(|c| c.index()).collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn threshold_must_be_within_bounds() {
        let spec = Arc::new(ChainSpec::mainnet());
        let make_clients = || {
            (0..2)
                .map(|i| {
                    let url = SensitiveUrl::from_str(&format!("http://localhost:{}", 6052 + i))
                        .unwrap();
                    BeaconNodeHttpClient::new(url, Timeouts::set_all(Duration::from_secs(1)))
                })
                .collect::<Vec<_>>()
        };
        assert!(BeaconNodeFallback::new(make_clients(), 0, spec.clone()).is_err());
        assert!(BeaconNodeFallback::new(make_clients(), 3, spec.clone()).is_err());
        assert!(BeaconNodeFallback::new(make_clients(), 2, spec).is_ok());
    }

    #[test]
    fn disabled_nodes_are_skipped() {
        let spec = Arc::new(ChainSpec::mainnet());
        let clients = (0..3)
            .map(|i| {
                let url =
                    SensitiveUrl::from_str(&format!("http://localhost:{}", 7052 + i)).unwrap();
                BeaconNodeHttpClient::new(url, Timeouts::set_all(Duration::from_secs(1)))
            })
            .collect();
        let fallback = BeaconNodeFallback::new(clients, 2, spec).unwrap();
        fallback.candidates()[1].set_enabled(false);
        assert_eq!(fallback.num_enabled(), 2);
        assert!(fallback
            .sorted_candidates()
            .iter()
            .all(|c| c.index() != 1));
    }
}
