//! Pure consensus arithmetic for the multi-beacon-node coordinator.
//!
//! Votes are counted by the canonical SSZ encoding of the value under
//! agreement, so "the same data" means byte-for-byte identity of
//! `(slot, index, head, source, target)`. Everything here is synchronous
//! and deterministic; the async fan-out layer feeds responses in arrival
//! order.

use eth2::types::{ProduceBlockV3Response, Uint256};
use ssz::Encode;
use std::collections::HashMap;
use types::{Attestation, AttestationData, Hash256};

/// Counts agreement over attestation data as responses arrive.
///
/// The first-arriving value of the winning group is returned, so ties and
/// group-internal ordering follow arrival order.
#[derive(Default)]
pub struct AttestationDataTally {
    votes: HashMap<Vec<u8>, (usize, AttestationData)>,
    /// Arrival order of first-seen keys, for deterministic inspection.
    order: Vec<Vec<u8>>,
}

impl AttestationDataTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one beacon node's response and returns the updated count of
    /// its group.
    pub fn add_vote(&mut self, data: AttestationData) -> usize {
        let key = data.as_ssz_bytes();
        let entry = self
            .votes
            .entry(key.clone())
            .or_insert_with(|| {
                self.order.push(key);
                (0, data)
            });
        entry.0 += 1;
        entry.0
    }

    /// The first-arriving representative of any group with at least
    /// `threshold` votes.
    pub fn winner(&self, threshold: usize) -> Option<AttestationData> {
        self.order.iter().find_map(|key| {
            let (count, data) = self.votes.get(key)?;
            (*count >= threshold).then_some(*data)
        })
    }

    pub fn total_votes(&self) -> usize {
        self.votes.values().map(|(count, _)| count).sum()
    }
}

/// `true` if the attestation data is pinned to the head root observed via
/// the event stream. Used to filter responses in head-pinned consensus
/// mode before they are tallied.
pub fn matches_known_head(data: &AttestationData, known_head: Hash256) -> bool {
    data.beacon_block_root == known_head
}

/// Selects the aggregate with the most participation bits. Ties are broken
/// by arrival order: an equal-popcount later candidate never displaces an
/// earlier one.
pub fn select_best_aggregate(
    candidates: impl IntoIterator<Item = Attestation>,
) -> Option<Attestation> {
    let mut best: Option<Attestation> = None;
    for candidate in candidates {
        let better = match &best {
            None => true,
            Some(current) => {
                candidate.num_set_aggregation_bits() > current.num_set_aggregation_bits()
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

/// The claimed value of a block response, in wei.
pub fn claimed_value(response: &ProduceBlockV3Response) -> Uint256 {
    response
        .consensus_block_value
        .saturating_add(response.execution_payload_value)
}

/// Compares two block candidates under the builder boost factor.
///
/// An externally-built (blinded) block's value counts as
/// `value * boost_factor / 100`. The comparison is cross-multiplied so no
/// precision is lost: `a` beats `b` iff `a_value * a_scale > b_value *
/// b_scale` over a common denominator.
fn boosted_exceeds(
    candidate: &ProduceBlockV3Response,
    current: &ProduceBlockV3Response,
    boost_factor: u64,
) -> bool {
    let scale = |response: &ProduceBlockV3Response| -> Uint256 {
        if response.execution_payload_blinded() {
            Uint256::from(boost_factor)
        } else {
            Uint256::from(100u64)
        }
    };
    claimed_value(candidate).saturating_mul(scale(candidate))
        > claimed_value(current).saturating_mul(scale(current))
}

/// Selects the block with the highest effective value. Ties are broken by
/// arrival order.
pub fn select_best_block(
    candidates: impl IntoIterator<Item = ProduceBlockV3Response>,
    boost_factor: u64,
) -> Option<ProduceBlockV3Response> {
    let mut best: Option<ProduceBlockV3Response> = None;
    for candidate in candidates {
        let better = match &best {
            None => true,
            Some(current) => boosted_exceeds(&candidate, current, boost_factor),
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use eth2::types::{ProduceBlockV3Data, Slot};
    use ssz_types::VariableList;
    use types::{BlindedBeaconBlock, Checkpoint, Epoch, SignatureBytes};

    fn data(head: u8, source_epoch: u64, target_epoch: u64) -> AttestationData {
        AttestationData {
            slot: Slot::new(100),
            index: 0,
            beacon_block_root: Hash256::repeat_byte(head),
            source: Checkpoint {
                epoch: Epoch::new(source_epoch),
                root: Hash256::repeat_byte(0x5a),
            },
            target: Checkpoint {
                epoch: Epoch::new(target_epoch),
                root: Hash256::repeat_byte(0x7a),
            },
        }
    }

    #[test]
    fn unanimous_agreement_reaches_threshold() {
        // Three nodes return identical data pinned to head 0xAB.
        let mut tally = AttestationDataTally::new();
        assert_eq!(tally.add_vote(data(0xab, 63, 3)), 1);
        assert_eq!(tally.add_vote(data(0xab, 63, 3)), 2);
        assert!(tally.winner(2).is_some());
        assert_eq!(tally.add_vote(data(0xab, 63, 3)), 3);
        assert_eq!(
            tally.winner(2).unwrap().beacon_block_root,
            Hash256::repeat_byte(0xab)
        );
    }

    #[test]
    fn divergent_head_majority_wins() {
        // BN1 sees 0xCD, BN2 and BN3 see 0xEF with matching checkpoints.
        let mut tally = AttestationDataTally::new();
        tally.add_vote(data(0xcd, 63, 3));
        tally.add_vote(data(0xef, 63, 3));
        assert!(tally.winner(2).is_none(), "no group has reached T yet");
        tally.add_vote(data(0xef, 63, 3));
        assert_eq!(
            tally.winner(2).unwrap().beacon_block_root,
            Hash256::repeat_byte(0xef)
        );
    }

    #[test]
    fn three_way_split_never_reaches_threshold() {
        let mut tally = AttestationDataTally::new();
        tally.add_vote(data(0xaa, 63, 3));
        tally.add_vote(data(0xbb, 63, 3));
        tally.add_vote(data(0xcc, 63, 3));
        assert_eq!(tally.total_votes(), 3);
        assert!(tally.winner(2).is_none());
    }

    #[test]
    fn checkpoint_disagreement_splits_groups_despite_same_head() {
        let mut tally = AttestationDataTally::new();
        tally.add_vote(data(0xab, 63, 3));
        tally.add_vote(data(0xab, 62, 3));
        assert!(tally.winner(2).is_none());
    }

    #[test]
    fn threshold_of_one_accepts_first_response() {
        let mut tally = AttestationDataTally::new();
        tally.add_vote(data(0xcd, 63, 3));
        tally.add_vote(data(0xef, 63, 3));
        assert_eq!(
            tally.winner(1).unwrap().beacon_block_root,
            Hash256::repeat_byte(0xcd),
            "with T=1 the earliest response wins"
        );
    }

    #[test]
    fn head_pinning_filter() {
        assert!(matches_known_head(
            &data(0xab, 63, 3),
            Hash256::repeat_byte(0xab)
        ));
        assert!(!matches_known_head(
            &data(0xcd, 63, 3),
            Hash256::repeat_byte(0xab)
        ));
    }

    fn aggregate_with_bits(bits: usize) -> Attestation {
        let mut attestation = Attestation::empty_for_signing(data(0xab, 63, 3), 64, 0).unwrap();
        for i in 0..bits {
            attestation.aggregation_bits.set(i, true).unwrap();
        }
        attestation
    }

    #[test]
    fn aggregate_with_highest_popcount_wins() {
        // BN1: 10 bits, BN2: 12 bits, BN3: 11 bits.
        let best = select_best_aggregate(vec![
            aggregate_with_bits(10),
            aggregate_with_bits(12),
            aggregate_with_bits(11),
        ])
        .unwrap();
        assert_eq!(best.num_set_aggregation_bits(), 12);
    }

    #[test]
    fn equal_popcount_keeps_first_arrival() {
        let mut first = aggregate_with_bits(10);
        first.data.beacon_block_root = Hash256::repeat_byte(0x01);
        let mut second = aggregate_with_bits(10);
        second.data.beacon_block_root = Hash256::repeat_byte(0x02);
        let best = select_best_aggregate(vec![first, second]).unwrap();
        assert_eq!(best.data.beacon_block_root, Hash256::repeat_byte(0x01));
    }

    fn builder_block(value_gwei: u64) -> ProduceBlockV3Response {
        ProduceBlockV3Response {
            version: "deneb".to_string(),
            data: ProduceBlockV3Data::Blinded(Box::new(BlindedBeaconBlock {
                slot: Slot::new(100),
                proposer_index: 0,
                parent_root: Hash256::ZERO,
                state_root: Hash256::ZERO,
                body: blinded_body(),
            })),
            execution_payload_value: gwei(value_gwei),
            consensus_block_value: Uint256::ZERO,
        }
    }

    fn local_block(value_gwei: u64) -> ProduceBlockV3Response {
        ProduceBlockV3Response {
            version: "deneb".to_string(),
            data: ProduceBlockV3Data::Full(Box::new(full_block_contents())),
            execution_payload_value: gwei(value_gwei),
            consensus_block_value: Uint256::ZERO,
        }
    }

    fn gwei(value: u64) -> Uint256 {
        Uint256::from(value) * Uint256::from(1_000_000_000u64)
    }

    fn blinded_body() -> types::BlindedBeaconBlockBody {
        use types::*;
        BlindedBeaconBlockBody {
            randao_reveal: SignatureBytes::empty(),
            eth1_data: Eth1Data {
                deposit_root: Hash256::ZERO,
                deposit_count: 0,
                block_hash: Hash256::ZERO,
            },
            graffiti: Graffiti::default(),
            proposer_slashings: VariableList::empty(),
            attester_slashings: VariableList::empty(),
            attestations: VariableList::empty(),
            deposits: VariableList::empty(),
            voluntary_exits: VariableList::empty(),
            sync_aggregate: SyncAggregate {
                sync_committee_bits: ssz_types::BitVector::new(),
                sync_committee_signature: SignatureBytes::empty(),
            },
            execution_payload_header: ExecutionPayloadHeader {
                parent_hash: Hash256::ZERO,
                fee_recipient: Address::ZERO,
                state_root: Hash256::ZERO,
                receipts_root: Hash256::ZERO,
                logs_bloom: ssz_types::FixedVector::default(),
                prev_randao: Hash256::ZERO,
                block_number: 0,
                gas_limit: 0,
                gas_used: 0,
                timestamp: 0,
                extra_data: VariableList::empty(),
                base_fee_per_gas: Uint256::ZERO,
                block_hash: Hash256::ZERO,
                transactions_root: Hash256::ZERO,
                withdrawals_root: Hash256::ZERO,
                blob_gas_used: 0,
                excess_blob_gas: 0,
            },
            bls_to_execution_changes: VariableList::empty(),
            blob_kzg_commitments: VariableList::empty(),
        }
    }

    #[test]
    fn boosted_builder_block_wins() {
        // Local blocks worth 20, 21, 22 Gwei; a builder block worth 25
        // Gwei at boost factor 90 has effective value 22.5 Gwei.
        let candidates = vec![
            local_block(20),
            local_block(21),
            local_block(22),
            builder_block(25),
        ];
        let best = select_best_block(candidates, 90).unwrap();
        assert!(best.execution_payload_blinded());
        assert_eq!(claimed_value(&best), gwei(25));
    }

    #[test]
    fn boost_below_local_value_prefers_local() {
        // Builder 25 Gwei at boost 80 -> effective 20 < local 22.
        let candidates = vec![local_block(22), builder_block(25)];
        let best = select_best_block(candidates, 80).unwrap();
        assert!(!best.execution_payload_blinded());
    }

    fn full_block_contents() -> types::BlockContents {
        use types::*;
        BlockContents {
            block: BeaconBlock {
                slot: Slot::new(100),
                proposer_index: 0,
                parent_root: Hash256::ZERO,
                state_root: Hash256::ZERO,
                body: BeaconBlockBody {
                    randao_reveal: SignatureBytes::empty(),
                    eth1_data: Eth1Data {
                        deposit_root: Hash256::ZERO,
                        deposit_count: 0,
                        block_hash: Hash256::ZERO,
                    },
                    graffiti: Graffiti::default(),
                    proposer_slashings: VariableList::empty(),
                    attester_slashings: VariableList::empty(),
                    attestations: VariableList::empty(),
                    deposits: VariableList::empty(),
                    voluntary_exits: VariableList::empty(),
                    sync_aggregate: SyncAggregate {
                        sync_committee_bits: ssz_types::BitVector::new(),
                        sync_committee_signature: SignatureBytes::empty(),
                    },
                    execution_payload: ExecutionPayload {
                        parent_hash: Hash256::ZERO,
                        fee_recipient: Address::ZERO,
                        state_root: Hash256::ZERO,
                        receipts_root: Hash256::ZERO,
                        logs_bloom: ssz_types::FixedVector::default(),
                        prev_randao: Hash256::ZERO,
                        block_number: 0,
                        gas_limit: 0,
                        gas_used: 0,
                        timestamp: 0,
                        extra_data: VariableList::empty(),
                        base_fee_per_gas: Uint256::ZERO,
                        block_hash: Hash256::ZERO,
                        transactions: VariableList::empty(),
                        withdrawals: VariableList::empty(),
                        blob_gas_used: 0,
                        excess_blob_gas: 0,
                    },
                    bls_to_execution_changes: VariableList::empty(),
                    blob_kzg_commitments: VariableList::empty(),
                },
            },
            kzg_proofs: VariableList::empty(),
            blobs: VariableList::empty(),
        }
    }
}
