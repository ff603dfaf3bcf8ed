use metrics::*;
use std::sync::LazyLock;

pub const SUCCESS: &str = "success";
pub const SLASHABLE: &str = "slashable";
pub const SAME_DATA: &str = "same_data";
pub const UNREGISTERED: &str = "unregistered";
pub const FULL_UPDATE: &str = "full_update";
pub const BEACON_BLOCK: &str = "beacon_block";
pub const BEACON_BLOCK_HTTP_GET: &str = "beacon_block_http_get";
pub const BEACON_BLOCK_HTTP_POST: &str = "beacon_block_http_post";
pub const ATTESTATIONS: &str = "attestations";
pub const ATTESTATIONS_HTTP_GET: &str = "attestations_http_get";
pub const ATTESTATIONS_HTTP_POST: &str = "attestations_http_post";
pub const AGGREGATES: &str = "aggregates";
pub const AGGREGATES_HTTP_GET: &str = "aggregates_http_get";
pub const AGGREGATES_HTTP_POST: &str = "aggregates_http_post";
pub const UPDATE_INDICES: &str = "update_indices";
pub const UPDATE_ATTESTERS: &str = "update_attesters";
pub const UPDATE_PROPOSERS: &str = "update_proposers";

pub static ATTESTATION_SERVICE_TIMES: LazyLock<Result<HistogramVec>> = LazyLock::new(|| {
    try_create_histogram_vec(
        "vc_attestation_service_task_times_seconds",
        "Duration to perform attestation service tasks",
        &["task"],
    )
});

pub static BLOCK_SERVICE_TIMES: LazyLock<Result<HistogramVec>> = LazyLock::new(|| {
    try_create_histogram_vec(
        "vc_beacon_block_service_task_times_seconds",
        "Duration to perform beacon block service tasks",
        &["task"],
    )
});

pub static DUTIES_SERVICE_TIMES: LazyLock<Result<HistogramVec>> = LazyLock::new(|| {
    try_create_histogram_vec(
        "vc_duties_service_task_times_seconds",
        "Duration to perform duties service tasks",
        &["task"],
    )
});

pub static SYNC_COMMITTEE_SERVICE_TIMES: LazyLock<Result<HistogramVec>> = LazyLock::new(|| {
    try_create_histogram_vec(
        "vc_sync_committee_service_task_times_seconds",
        "Duration to perform sync committee service tasks",
        &["task"],
    )
});

/// Time from the start of the slot until cross-beacon-node consensus on
/// attestation data is reached.
pub static ATTESTATION_CONSENSUS_TIME: LazyLock<Result<Histogram>> = LazyLock::new(|| {
    try_create_histogram(
        "attestation_consensus_time_seconds",
        "Time taken to reach threshold agreement on attestation data",
    )
});

pub static ATTESTATION_CONSENSUS_FAILURES: LazyLock<Result<IntCounter>> = LazyLock::new(|| {
    try_create_int_counter(
        "attestation_consensus_failures_total",
        "Number of slots in which attestation data did not reach threshold agreement",
    )
});

/// Time from the duty deadline until the signed message is accepted by a
/// beacon node, per duty kind.
pub static DUTY_SUBMISSION_TIME: LazyLock<Result<HistogramVec>> = LazyLock::new(|| {
    try_create_histogram_vec(
        "duty_submission_time_seconds",
        "Time taken to submit a signed duty to a beacon node",
        &["duty"],
    )
});

pub static BEACON_NODE_SCORE: LazyLock<Result<IntGaugeVec>> = LazyLock::new(|| {
    try_create_int_gauge_vec(
        "beacon_node_score",
        "Health score of each connected beacon node",
        &["node"],
    )
});

pub static REMOTE_SIGNER_SCORE: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "remote_signer_score",
        "Health score of the remote signer",
    )
});

/// Reads 1 once the slashing latch is set; never returns to 0 in-process.
pub static SLASHING_DETECTED: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "slashing_detected",
        "Whether a managed validator has been observed as slashed",
    )
});

pub static VALIDATOR_COUNT: LazyLock<Result<IntGaugeVec>> = LazyLock::new(|| {
    try_create_int_gauge_vec(
        "validator_count",
        "Number of managed validators by status",
        &["status"],
    )
});

pub static SIGNED_MESSAGES_TOTAL: LazyLock<Result<IntCounterVec>> = LazyLock::new(|| {
    try_create_int_counter_vec(
        "vc_signed_messages_total",
        "Messages signed by the remote signer on the client's behalf",
        &["message_kind", "status"],
    )
});

pub static DOPPELGANGER_DETECTED: LazyLock<Result<IntGauge>> = LazyLock::new(|| {
    try_create_int_gauge(
        "vc_doppelganger_detected",
        "Whether a doppelganger has been observed for a managed validator",
    )
});
