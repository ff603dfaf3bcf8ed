use crate::duties_service::DutiesService;
use beacon_node_fallback::BeaconNodeFallback;
use eth2::types::{EventKind, EventTopic, SseHead, StateId, ValidatorId};
use futures::StreamExt;
use logging::crit;
use parking_lot::{Mutex, RwLock};
use slot_clock::SlotClock;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use task_executor::TaskExecutor;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tree_hash::TreeHash;
use types::{ChainSpec, Hash256, Slot};
use validator_store::{SlashingLatch, ValidatorStore};

/// Validator statuses are cross-checked for `*_slashed` this often.
const STATUS_POLL_INTERVAL_SLOTS: u64 = 4;

/// The initial SSE reconnect delay; doubles per failure, capped at one
/// slot.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// A head event is late if it arrives after this fraction of the slot.
const LATE_HEAD_NUMERATOR: u32 = 4;
const LATE_HEAD_DENOMINATOR: u32 = 12;

/// The most recent deduplicated head, shared with the attestation and
/// sync-committee executors.
#[derive(Default)]
pub struct HeadTracker {
    latest: RwLock<Option<(Slot, Hash256)>>,
}

impl HeadTracker {
    /// The head root observed for exactly `slot`, if any.
    pub fn head_for(&self, slot: Slot) -> Option<Hash256> {
        let latest = self.latest.read();
        match latest.deref() {
            Some((head_slot, root)) if *head_slot == slot => Some(*root),
            _ => None,
        }
    }

    /// The most recent head at or before `slot`.
    pub fn latest_root(&self) -> Option<Hash256> {
        self.latest.read().map(|(_, root)| root)
    }

    fn record(&self, slot: Slot, root: Hash256) {
        let mut latest = self.latest.write();
        if latest.map_or(true, |(prev_slot, _)| prev_slot <= slot) {
            *latest = Some((slot, root));
        }
    }
}

/// Per-kind deduplication over the merged event stream.
#[derive(Default)]
struct DedupCaches {
    heads: HashSet<(Slot, Hash256)>,
    reorgs: HashSet<(Slot, Hash256)>,
    slashings: HashSet<Hash256>,
}

impl DedupCaches {
    fn prune(&mut self, cutoff: Slot) {
        self.heads.retain(|(slot, _)| *slot >= cutoff);
        self.reorgs.retain(|(slot, _)| *slot >= cutoff);
        // Slashing roots are few; retain them all for the process life.
    }
}

pub struct EventServiceBuilder<S, T> {
    duties_service: Option<Arc<DutiesService<S, T>>>,
    slot_clock: Option<T>,
    beacon_nodes: Option<Arc<BeaconNodeFallback>>,
    executor: Option<TaskExecutor>,
    spec: Option<Arc<ChainSpec>>,
    slashing_detection_enabled: bool,
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> EventServiceBuilder<S, T> {
    pub fn new() -> Self {
        Self {
            duties_service: None,
            slot_clock: None,
            beacon_nodes: None,
            executor: None,
            spec: None,
            slashing_detection_enabled: true,
        }
    }

    pub fn duties_service(mut self, service: Arc<DutiesService<S, T>>) -> Self {
        self.duties_service = Some(service);
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

    /// Disabling detection stops the latch being *set* by this service;
    /// the latch checks in every executor stay wired regardless.
    pub fn slashing_detection_enabled(mut self, enabled: bool) -> Self {
        self.slashing_detection_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<EventService<S, T>, String> {
        Ok(EventService {
            inner: Arc::new(Inner {
                duties_service: self
                    .duties_service
                    .ok_or("Cannot build EventService without duties_service")?,
                slot_clock: self
                    .slot_clock
                    .ok_or("Cannot build EventService without slot_clock")?,
                beacon_nodes: self
                    .beacon_nodes
                    .ok_or("Cannot build EventService without beacon_nodes")?,
                executor: self
                    .executor
                    .ok_or("Cannot build EventService without executor")?,
                spec: self.spec.ok_or("Cannot build EventService without spec")?,
                slashing_detection_enabled: self.slashing_detection_enabled,
                head_tracker: Arc::new(HeadTracker::default()),
                dedup: Mutex::new(DedupCaches::default()),
                head_subscribers: Mutex::new(vec![]),
            }),
        })
    }
}

pub struct Inner<S, T> {
    duties_service: Arc<DutiesService<S, T>>,
    slot_clock: T,
    beacon_nodes: Arc<BeaconNodeFallback>,
    executor: TaskExecutor,
    spec: Arc<ChainSpec>,
    slashing_detection_enabled: bool,
    head_tracker: Arc<HeadTracker>,
    dedup: Mutex<DedupCaches>,
    head_subscribers: Mutex<Vec<mpsc::Sender<SseHead>>>,
}

/// Merges the event streams of every beacon node into one deduplicated
/// logical stream, drives head notifications into the duty executors, and
/// hosts the slashing detector.
pub struct EventService<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for EventService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> Deref for EventService<S, T> {
    type Target = Inner<S, T>;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<S: ValidatorStore + 'static, T: SlotClock + 'static> EventService<S, T> {
    pub fn head_tracker(&self) -> Arc<HeadTracker> {
        self.head_tracker.clone()
    }

    /// Registers a channel that receives each first-seen head event.
    pub fn subscribe_heads(&self) -> mpsc::Receiver<SseHead> {
        let (tx, rx) = mpsc::channel(16);
        self.head_subscribers.lock().push(tx);
        rx
    }

    pub fn start_update_service(self) -> Result<(), String> {
        let (event_tx, mut event_rx) = mpsc::channel::<EventKind>(256);

        // One persistent subscription per beacon node, reconnecting with
        // exponential backoff capped at one slot.
        for candidate in self.beacon_nodes.candidates() {
            let candidate = candidate.clone();
            let event_tx = event_tx.clone();
            let slot_duration = self.spec.slot_duration();
            self.executor.spawn(
                async move {
                    let mut delay = INITIAL_RECONNECT_DELAY;
                    loop {
                        match candidate.client().get_events(&EventTopic::all()) {
                            Ok(stream) => {
                                futures::pin_mut!(stream);
                                while let Some(event) = stream.next().await {
                                    match event {
                                        Ok(kind) => {
                                            delay = INITIAL_RECONNECT_DELAY;
                                            if event_tx.send(kind).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            debug!(
                                                node = %candidate,
                                                error = %e,
                                                "Event stream interrupted"
                                            );
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(node = %candidate, error = %e, "Unable to open event stream")
                            }
                        }
                        sleep(delay).await;
                        delay = (delay * 2).min(slot_duration);
                    }
                },
                "beacon_node_event_stream",
            );
        }

        // The merged consumer.
        let service = self.clone();
        self.executor.spawn(
            async move {
                while let Some(event) = event_rx.recv().await {
                    service.handle_event(event);
                }
                debug!("Event pipeline shutting down");
            },
            "event_pipeline",
        );

        // The 4-slot validator status cross-check.
        let service = self.clone();
        self.executor.spawn(
            async move {
                loop {
                    match service.slot_clock.duration_to_next_slot() {
                        Some(duration) => {
                            sleep(
                                duration
                                    + service.slot_clock.slot_duration()
                                        * (STATUS_POLL_INTERVAL_SLOTS as u32 - 1),
                            )
                            .await
                        }
                        None => {
                            sleep(service.slot_clock.slot_duration()).await;
                            continue;
                        }
                    }
                    service.poll_validator_statuses().await;
                }
            },
            "slashing_status_poll",
        );

        info!(
            nodes = self.beacon_nodes.num_total(),
            "Event pipeline started"
        );
        Ok(())
    }

    fn latch(&self) -> &SlashingLatch {
        self.duties_service.validator_store.slashing_latch()
    }

    fn handle_event(&self, event: EventKind) {
        match event {
            EventKind::Head(head) => self.handle_head(head),
            EventKind::ChainReorg(reorg) => {
                if !self
                    .dedup
                    .lock()
                    .reorgs
                    .insert((reorg.slot, reorg.new_head_block))
                {
                    return;
                }
                let old_slot = reorg.slot.saturating_sub(reorg.depth);
                let crosses_epoch_boundary = old_slot.epoch(self.spec.slots_per_epoch)
                    != reorg.slot.epoch(self.spec.slots_per_epoch);
                warn!(
                    slot = %reorg.slot,
                    depth = reorg.depth,
                    new_head = ?reorg.new_head_block,
                    crosses_epoch_boundary,
                    "Chain reorg observed"
                );
                let epoch = reorg.slot.epoch(self.spec.slots_per_epoch);
                if crosses_epoch_boundary {
                    self.beacon_nodes.invalidate_checkpoint_cache();
                    // Conservative: re-derive duties and their selection
                    // proofs for the affected epochs.
                    self.duties_service.invalidate_epoch(epoch);
                    self.duties_service.invalidate_epoch(epoch + 1u64);
                }
            }
            EventKind::AttesterSlashing(slashing) => {
                let root = slashing.tree_hash_root();
                if !self.dedup.lock().slashings.insert(root) {
                    return;
                }
                let offenders = slashing.offending_indices();
                self.check_offenders(&offenders, "attester_slashing");
            }
            EventKind::ProposerSlashing(slashing) => {
                let root = slashing.tree_hash_root();
                if !self.dedup.lock().slashings.insert(root) {
                    return;
                }
                self.check_offenders(&[slashing.offending_index()], "proposer_slashing");
            }
            EventKind::BlockGossip(gossip) => {
                debug!(slot = %gossip.slot, block = ?gossip.block, "Block gossip observed");
            }
        }
    }

    fn handle_head(&self, head: SseHead) {
        {
            let mut dedup = self.dedup.lock();
            // First occurrence wins; replays from other nodes are dropped.
            if !dedup.heads.insert((head.slot, head.block)) {
                return;
            }
            if let Some(current_slot) = self.slot_clock.now() {
                dedup.prune(
                    current_slot.saturating_sub(2 * self.spec.slots_per_epoch),
                );
            }
        }

        self.head_tracker.record(head.slot, head.block);

        // A head arriving after 4/12 of its own slot is too late to help
        // the attestation path; correctness is unaffected but it is worth
        // an operator warning.
        if self.slot_clock.now() == Some(head.slot) {
            if let Some(into_slot) = self.slot_clock.seconds_into_slot() {
                let late_cutoff =
                    self.spec.slot_duration() * LATE_HEAD_NUMERATOR / LATE_HEAD_DENOMINATOR;
                if into_slot > late_cutoff {
                    warn!(
                        slot = %head.slot,
                        block = ?head.block,
                        delay_ms = into_slot.as_millis(),
                        "Late head event"
                    );
                }
            }
        }

        debug!(slot = %head.slot, block = ?head.block, "New head observed");

        let mut subscribers = self.head_subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(head.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Latches if any of `offenders` is a managed validator index.
    fn check_offenders(&self, offenders: &[u64], kind: &str) {
        let managed: Vec<u64> = offenders
            .iter()
            .copied()
            .filter(|index| self.duties_service.registry.contains_index(*index))
            .collect();
        if managed.is_empty() {
            debug!(kind, ?offenders, "Slashing event for unmanaged validators");
            return;
        }

        if !self.slashing_detection_enabled {
            crit!(
                kind,
                indices = ?managed,
                "Managed validator slashed but slashing detection is disabled"
            );
            return;
        }

        if self.latch().set() {
            crit!(
                kind,
                indices = ?managed,
                "Managed validator slashed! All signing is now disabled"
            );
        }
    }

    /// The polling cross-check: any `*_slashed` status latches, catching
    /// slashings whose gossip this client never saw.
    async fn poll_validator_statuses(&self) {
        let registry = &self.duties_service.registry;
        let ids: Vec<ValidatorId> = registry
            .pubkeys()
            .into_iter()
            .map(ValidatorId::PublicKey)
            .collect();
        if ids.is_empty() {
            return;
        }

        let data = match self
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
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "Validator status poll failed");
                return;
            }
        };

        registry.apply_chain_view(data);
        let slashed: Vec<_> = registry
            .snapshot()
            .into_iter()
            .filter(|record| record.status.is_slashed())
            .map(|record| record.pubkey)
            .collect();

        if slashed.is_empty() {
            return;
        }

        if !self.slashing_detection_enabled {
            crit!(
                pubkeys = ?slashed,
                "Managed validator has a slashed status but slashing detection is disabled"
            );
            return;
        }

        if self.latch().set() {
            crit!(
                pubkeys = ?slashed,
                "Managed validator has a slashed status! All signing is now disabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_tracker_first_occurrence_wins_per_slot() {
        let tracker = HeadTracker::default();
        tracker.record(Slot::new(10), Hash256::repeat_byte(0xab));
        assert_eq!(
            tracker.head_for(Slot::new(10)),
            Some(Hash256::repeat_byte(0xab))
        );
        assert_eq!(tracker.head_for(Slot::new(11)), None);

        // A newer slot supersedes.
        tracker.record(Slot::new(11), Hash256::repeat_byte(0xcd));
        assert_eq!(tracker.head_for(Slot::new(10)), None);
        assert_eq!(tracker.latest_root(), Some(Hash256::repeat_byte(0xcd)));

        // An older slot does not regress the tracker.
        tracker.record(Slot::new(9), Hash256::repeat_byte(0x01));
        assert_eq!(tracker.latest_root(), Some(Hash256::repeat_byte(0xcd)));
    }

    #[test]
    fn dedup_caches_deduplicate_and_prune() {
        let mut caches = DedupCaches::default();
        assert!(caches.heads.insert((Slot::new(5), Hash256::repeat_byte(1))));
        assert!(!caches.heads.insert((Slot::new(5), Hash256::repeat_byte(1))));
        assert!(caches.heads.insert((Slot::new(5), Hash256::repeat_byte(2))));

        assert!(caches.slashings.insert(Hash256::repeat_byte(9)));
        assert!(!caches.slashings.insert(Hash256::repeat_byte(9)));

        caches.prune(Slot::new(6));
        assert!(caches.heads.is_empty());
        assert!(
            caches.slashings.contains(&Hash256::repeat_byte(9)),
            "slashing dedup is retained"
        );
    }
}
