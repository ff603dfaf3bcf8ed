//! This module exposes a superset of the `types` crate. It adds additional
//! types that are only required for the HTTP API.

use crate::Error as ServerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
pub use types::*;

/// An API error serializable to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub stacktraces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Hash256,
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub genesis_fork_version: [u8; 4],
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StateId {
    Head,
    Genesis,
    Finalized,
    Justified,
    Slot(Slot),
    Root(Hash256),
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateId::Head => write!(f, "head"),
            StateId::Genesis => write!(f, "genesis"),
            StateId::Finalized => write!(f, "finalized"),
            StateId::Justified => write!(f, "justified"),
            StateId::Slot(slot) => write!(f, "{}", slot),
            StateId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BlockId {
    Head,
    Genesis,
    Finalized,
    Slot(Slot),
    Root(Hash256),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => write!(f, "head"),
            BlockId::Genesis => write!(f, "genesis"),
            BlockId::Finalized => write!(f, "finalized"),
            BlockId::Slot(slot) => write!(f, "{}", slot),
            BlockId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct GenericResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub data: T,
}

impl<T: Serialize + serde::de::DeserializeOwned> From<T> for GenericResponse<T> {
    fn from(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct DutiesResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub dependent_root: Hash256,
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootData {
    pub root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalityCheckpointsData {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatorId {
    PublicKey(PublicKeyBytes),
    Index(u64),
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorId::PublicKey(pubkey) => write!(f, "{:?}", pubkey),
            ValidatorId::Index(index) => write!(f, "{}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: u64,
    pub status: ValidatorStatus,
    pub validator: Validator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
    Unknown,
}

impl ValidatorStatus {
    /// `true` for any status under which duties should be performed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ValidatorStatus::ActiveOngoing | ValidatorStatus::ActiveExiting
        )
    }

    /// `true` for any status indicating the chain has slashed the key.
    pub fn is_slashed(&self) -> bool {
        matches!(
            self,
            ValidatorStatus::ActiveSlashed | ValidatorStatus::ExitedSlashed
        )
    }
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorStatus::PendingInitialized => write!(f, "pending_initialized"),
            ValidatorStatus::PendingQueued => write!(f, "pending_queued"),
            ValidatorStatus::ActiveOngoing => write!(f, "active_ongoing"),
            ValidatorStatus::ActiveExiting => write!(f, "active_exiting"),
            ValidatorStatus::ActiveSlashed => write!(f, "active_slashed"),
            ValidatorStatus::ExitedUnslashed => write!(f, "exited_unslashed"),
            ValidatorStatus::ExitedSlashed => write!(f, "exited_slashed"),
            ValidatorStatus::WithdrawalPossible => write!(f, "withdrawal_possible"),
            ValidatorStatus::WithdrawalDone => write!(f, "withdrawal_done"),
            ValidatorStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncingData {
    pub is_syncing: bool,
    #[serde(default)]
    pub el_offline: Option<bool>,
    pub head_slot: Slot,
    pub sync_distance: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttesterData {
    pub pubkey: PublicKeyBytes,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committees_at_slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_index: CommitteeIndex,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_length: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_committee_index: u64,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerData {
    pub pubkey: PublicKeyBytes,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResponseData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub is_live: bool,
}

/// The request body for `POST beacon/states/{state_id}/validators`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorsRequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<ValidatorId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<ValidatorStatus>>,
}

impl Serialize for ValidatorId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ValidatorId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.starts_with("0x") {
            PublicKeyBytes::from_str(&s)
                .map(ValidatorId::PublicKey)
                .map_err(serde::de::Error::custom)
        } else {
            u64::from_str(&s)
                .map(ValidatorId::Index)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// The fork context a `v2` block publication carries in its
/// `Eth-Consensus-Version` header.
pub const CONSENSUS_VERSION_HEADER: &str = "Eth-Consensus-Version";

/// A block returned by the `v3` produce endpoint, together with the values
/// the coordinator compares across beacon nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceBlockV3Response {
    pub version: String,
    pub data: ProduceBlockV3Data,
    pub execution_payload_value: Uint256,
    pub consensus_block_value: Uint256,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProduceBlockV3Data {
    Full(Box<BlockContents>),
    Blinded(Box<BlindedBeaconBlock>),
}

impl ProduceBlockV3Response {
    pub fn execution_payload_blinded(&self) -> bool {
        matches!(self.data, ProduceBlockV3Data::Blinded(_))
    }

    pub fn slot(&self) -> Slot {
        match &self.data {
            ProduceBlockV3Data::Full(contents) => contents.block.slot,
            ProduceBlockV3Data::Blinded(block) => block.slot,
        }
    }

    pub fn proposer_index(&self) -> u64 {
        match &self.data {
            ProduceBlockV3Data::Full(contents) => contents.block.proposer_index,
            ProduceBlockV3Data::Blinded(block) => block.proposer_index,
        }
    }
}

// --------- Server Sent Event Types -----------

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct SseHead {
    pub slot: Slot,
    pub block: Hash256,
    pub state: Hash256,
    #[serde(default)]
    pub epoch_transition: bool,
}

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct SseChainReorg {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub depth: u64,
    pub old_head_block: Hash256,
    pub new_head_block: Hash256,
    pub old_head_state: Hash256,
    pub new_head_state: Hash256,
    pub epoch: Epoch,
}

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct SseBlockGossip {
    pub slot: Slot,
    pub block: Hash256,
}

#[derive(PartialEq, Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum EventKind {
    Head(SseHead),
    ChainReorg(SseChainReorg),
    AttesterSlashing(Box<AttesterSlashing>),
    ProposerSlashing(Box<ProposerSlashing>),
    BlockGossip(SseBlockGossip),
}

impl EventKind {
    pub fn topic_name(&self) -> &'static str {
        match self {
            EventKind::Head(_) => "head",
            EventKind::ChainReorg(_) => "chain_reorg",
            EventKind::AttesterSlashing(_) => "attester_slashing",
            EventKind::ProposerSlashing(_) => "proposer_slashing",
            EventKind::BlockGossip(_) => "block_gossip",
        }
    }

    /// Parses one server-sent event, given the `event:` tag and `data:`
    /// payload.
    pub fn from_sse_parts(event: &str, data: &str) -> Result<Self, ServerError> {
        match event {
            "head" => Ok(EventKind::Head(serde_json::from_str(data).map_err(
                |e| ServerError::InvalidServerSentEvent(format!("Head: {:?}", e)),
            )?)),
            "chain_reorg" => Ok(EventKind::ChainReorg(serde_json::from_str(data).map_err(
                |e| ServerError::InvalidServerSentEvent(format!("Chain Reorg: {:?}", e)),
            )?)),
            "attester_slashing" => Ok(EventKind::AttesterSlashing(
                serde_json::from_str(data).map_err(|e| {
                    ServerError::InvalidServerSentEvent(format!("Attester Slashing: {:?}", e))
                })?,
            )),
            "proposer_slashing" => Ok(EventKind::ProposerSlashing(
                serde_json::from_str(data).map_err(|e| {
                    ServerError::InvalidServerSentEvent(format!("Proposer Slashing: {:?}", e))
                })?,
            )),
            "block_gossip" => Ok(EventKind::BlockGossip(serde_json::from_str(data).map_err(
                |e| ServerError::InvalidServerSentEvent(format!("Block Gossip: {:?}", e)),
            )?)),
            _ => Err(ServerError::InvalidServerSentEvent(format!(
                "Unexpected event tag: {}",
                event
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    Head,
    ChainReorg,
    AttesterSlashing,
    ProposerSlashing,
    BlockGossip,
}

impl EventTopic {
    /// Every topic the client subscribes to.
    pub fn all() -> [EventTopic; 5] {
        [
            EventTopic::Head,
            EventTopic::ChainReorg,
            EventTopic::AttesterSlashing,
            EventTopic::ProposerSlashing,
            EventTopic::BlockGossip,
        ]
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTopic::Head => write!(f, "head"),
            EventTopic::ChainReorg => write!(f, "chain_reorg"),
            EventTopic::AttesterSlashing => write!(f, "attester_slashing"),
            EventTopic::ProposerSlashing => write!(f, "proposer_slashing"),
            EventTopic::BlockGossip => write!(f, "block_gossip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_event_parses() {
        let data = r#"{"slot":"100","block":"0xabababababababababababababababababababababababababababababababab","state":"0x0101010101010101010101010101010101010101010101010101010101010101","epoch_transition":false}"#;
        let event = EventKind::from_sse_parts("head", data).unwrap();
        match event {
            EventKind::Head(head) => {
                assert_eq!(head.slot, Slot::new(100));
                assert_eq!(head.block, Hash256::repeat_byte(0xab));
            }
            _ => panic!("expected head event"),
        }
    }

    #[test]
    fn unknown_event_tag_is_an_error() {
        assert!(EventKind::from_sse_parts("finalized_checkpoint", "{}").is_err());
    }

    #[test]
    fn validator_status_serde_matches_api_strings() {
        let status: ValidatorStatus = serde_json::from_str("\"active_ongoing\"").unwrap();
        assert_eq!(status, ValidatorStatus::ActiveOngoing);
        assert!(ValidatorStatus::ExitedSlashed.is_slashed());
        assert!(!ValidatorStatus::ExitedUnslashed.is_slashed());
    }
}
