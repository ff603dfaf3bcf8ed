//! This crate provides two major things:
//!
//! 1. The types served by the standard Beacon API (`types.rs`).
//! 2. A wrapper around `reqwest` that forms a HTTP client for the API
//!    (`BeaconNodeHttpClient`).

pub mod types;

use futures::Stream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{IntoUrl, Response};
pub use reqwest::{StatusCode, Url};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use sensitive_url::SensitiveUrl;
use serde::de::DeserializeOwned;
use serde::Serialize;
use ssz::Encode;
use std::fmt;
use std::time::Duration;

use self::types::*;

#[derive(Debug)]
pub enum Error {
    /// The `reqwest` client raised an error.
    HttpClient(reqwest::Error),
    /// The server returned an error message where the body was able to be
    /// parsed.
    ServerMessage(ErrorMessage),
    /// The server returned an error message with an unparseable body.
    StatusCode(StatusCode),
    /// The supplied URL is badly formed.
    InvalidUrl(String),
    /// The server returned a 2xx body the client was unable to parse.
    InvalidResponse(String),
    /// The server sent an event the client was unable to parse.
    InvalidServerSentEvent(String),
    /// The event stream ended.
    EventStreamEnded,
}

impl Error {
    /// If the error has a HTTP status code, returns it.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpClient(e) => e.status(),
            Error::ServerMessage(e) => StatusCode::from_u16(e.code).ok(),
            Error::StatusCode(status) => Some(*status),
            _ => None,
        }
    }

    /// `true` when the failure was the request not completing in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::HttpClient(e) if e.is_timeout())
    }

    /// `true` when a connection could not be established at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::HttpClient(e) if e.is_connect())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::HttpClient(error)
    }
}

/// Per-operation-class timeouts, each derived from the slot schedule by the
/// caller that constructs the client.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub attestation: Duration,
    pub aggregate: Duration,
    pub attester_duties: Duration,
    pub liveness: Duration,
    pub proposal: Duration,
    pub proposer_duties: Duration,
    pub sync_committee_contribution: Duration,
    pub sync_duties: Duration,
    pub default: Duration,
}

impl Timeouts {
    pub fn set_all(timeout: Duration) -> Self {
        Timeouts {
            attestation: timeout,
            aggregate: timeout,
            attester_duties: timeout,
            liveness: timeout,
            proposal: timeout,
            proposer_duties: timeout,
            sync_committee_contribution: timeout,
            sync_duties: timeout,
            default: timeout,
        }
    }
}

/// A wrapper around `reqwest::Client` which provides convenience methods
/// for interfacing with a beacon node's HTTP API.
#[derive(Clone)]
pub struct BeaconNodeHttpClient {
    client: reqwest::Client,
    server: SensitiveUrl,
    timeouts: Timeouts,
}

impl fmt::Display for BeaconNodeHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server)
    }
}

impl BeaconNodeHttpClient {
    pub fn new(server: SensitiveUrl, timeouts: Timeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
            timeouts,
        }
    }

    pub fn from_components(
        server: SensitiveUrl,
        client: reqwest::Client,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            client,
            server,
            timeouts,
        }
    }

    /// The redacted base URL of the server, suitable for logs and metric
    /// labels.
    pub fn server_url(&self) -> &SensitiveUrl {
        &self.server
    }

    fn url(&self, path: &[&str]) -> Result<Url, Error> {
        let mut url = self.server.full.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.to_string()))?
            .extend(path);
        Ok(url)
    }

    async fn ok_or_error(&self, response: Response) -> Result<Response, Error> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else if let Ok(message) = response.json().await {
            Err(Error::ServerMessage(message))
        } else {
            Err(Error::StatusCode(status))
        }
    }

    async fn get_response<U: IntoUrl>(&self, url: U, timeout: Duration) -> Result<Response, Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        self.ok_or_error(response).await
    }

    async fn get_with_timeout<T: DeserializeOwned, U: IntoUrl>(
        &self,
        url: U,
        timeout: Duration,
    ) -> Result<T, Error> {
        self.get_response(url, timeout)
            .await?
            .json()
            .await
            .map_err(Into::into)
    }

    /// Perform a HTTP GET request, returning `None` on a 404 error.
    async fn get_opt<T: DeserializeOwned, U: IntoUrl>(
        &self,
        url: U,
        timeout: Duration,
    ) -> Result<Option<T>, Error> {
        match self.get_response(url, timeout).await {
            Ok(resp) => resp.json().await.map(Some).map_err(Into::into),
            Err(err) => {
                if err.status() == Some(StatusCode::NOT_FOUND) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn post_with_timeout<T: Serialize, U: IntoUrl>(
        &self,
        url: U,
        body: &T,
        timeout: Duration,
    ) -> Result<(), Error> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        self.ok_or_error(response).await?;
        Ok(())
    }

    async fn post_with_response<T: Serialize, R: DeserializeOwned, U: IntoUrl>(
        &self,
        url: U,
        body: &T,
        timeout: Duration,
    ) -> Result<R, Error> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        self.ok_or_error(response)
            .await?
            .json()
            .await
            .map_err(Into::into)
    }

    async fn post_ssz_with_headers<U: IntoUrl>(
        &self,
        url: U,
        body: Vec<u8>,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<(), Error> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .headers(headers)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        self.ok_or_error(response).await?;
        Ok(())
    }

    /// `GET beacon/genesis`
    pub async fn get_beacon_genesis(&self) -> Result<GenericResponse<GenesisData>, Error> {
        let url = self.url(&["eth", "v1", "beacon", "genesis"])?;
        self.get_with_timeout(url, self.timeouts.default).await
    }

    /// `GET config/spec`
    pub async fn get_config_spec(
        &self,
    ) -> Result<GenericResponse<std::collections::HashMap<String, serde_json::Value>>, Error> {
        let url = self.url(&["eth", "v1", "config", "spec"])?;
        self.get_with_timeout(url, self.timeouts.default).await
    }

    /// `GET node/syncing`
    pub async fn get_node_syncing(&self) -> Result<GenericResponse<SyncingData>, Error> {
        let url = self.url(&["eth", "v1", "node", "syncing"])?;
        self.get_with_timeout(url, self.timeouts.default).await
    }

    /// `GET beacon/states/{state_id}/finality_checkpoints`
    pub async fn get_beacon_states_finality_checkpoints(
        &self,
        state_id: StateId,
    ) -> Result<Option<GenericResponse<FinalityCheckpointsData>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "beacon",
            "states",
            &state_id.to_string(),
            "finality_checkpoints",
        ])?;
        self.get_opt(url, self.timeouts.default).await
    }

    /// `POST beacon/states/{state_id}/validators`
    pub async fn post_beacon_states_validators(
        &self,
        state_id: StateId,
        ids: Option<Vec<ValidatorId>>,
        statuses: Option<Vec<ValidatorStatus>>,
    ) -> Result<GenericResponse<Vec<ValidatorData>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "beacon",
            "states",
            &state_id.to_string(),
            "validators",
        ])?;
        self.post_with_response(url, &ValidatorsRequestBody { ids, statuses }, self.timeouts.default)
            .await
    }

    /// `GET beacon/blocks/{block_id}/root`
    pub async fn get_beacon_blocks_root(
        &self,
        block_id: BlockId,
    ) -> Result<Option<GenericResponse<RootData>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "beacon",
            "blocks",
            &block_id.to_string(),
            "root",
        ])?;
        self.get_opt(url, self.timeouts.default).await
    }

    /// `POST validator/duties/attester/{epoch}`
    pub async fn post_validator_duties_attester(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<DutiesResponse<Vec<AttesterData>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "validator",
            "duties",
            "attester",
            &epoch.to_string(),
        ])?;
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        self.post_with_response(url, &body, self.timeouts.attester_duties)
            .await
    }

    /// `GET validator/duties/proposer/{epoch}`
    pub async fn get_validator_duties_proposer(
        &self,
        epoch: Epoch,
    ) -> Result<DutiesResponse<Vec<ProposerData>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "validator",
            "duties",
            "proposer",
            &epoch.to_string(),
        ])?;
        self.get_with_timeout(url, self.timeouts.proposer_duties)
            .await
    }

    /// `POST validator/duties/sync/{epoch}`
    pub async fn post_validator_duties_sync(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GenericResponse<Vec<SyncDuty>>, Error> {
        let url = self.url(&[
            "eth",
            "v1",
            "validator",
            "duties",
            "sync",
            &epoch.to_string(),
        ])?;
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        self.post_with_response(url, &body, self.timeouts.sync_duties)
            .await
    }

    /// `GET validator/attestation_data?slot,committee_index`
    pub async fn get_validator_attestation_data(
        &self,
        slot: Slot,
        committee_index: CommitteeIndex,
    ) -> Result<GenericResponse<AttestationData>, Error> {
        let mut url = self.url(&["eth", "v1", "validator", "attestation_data"])?;
        url.query_pairs_mut()
            .append_pair("slot", &slot.to_string())
            .append_pair("committee_index", &committee_index.to_string());
        self.get_with_timeout(url, self.timeouts.attestation).await
    }

    /// `GET validator/aggregate_attestation?slot,attestation_data_root`
    pub async fn get_validator_aggregate_attestation(
        &self,
        slot: Slot,
        attestation_data_root: Hash256,
    ) -> Result<Option<GenericResponse<Attestation>>, Error> {
        let mut url = self.url(&["eth", "v1", "validator", "aggregate_attestation"])?;
        url.query_pairs_mut()
            .append_pair("slot", &slot.to_string())
            .append_pair(
                "attestation_data_root",
                &format!("{:?}", attestation_data_root),
            );
        self.get_opt(url, self.timeouts.aggregate).await
    }

    /// `GET v3/validator/blocks/{slot}`, returning the block alongside the
    /// values used for best-block selection.
    pub async fn get_validator_blocks_v3(
        &self,
        slot: Slot,
        randao_reveal: &SignatureBytes,
        graffiti: Option<&Graffiti>,
        builder_boost_factor: Option<u64>,
    ) -> Result<ProduceBlockV3Response, Error> {
        let mut url = self.url(&["eth", "v3", "validator", "blocks", &slot.to_string()])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("randao_reveal", &randao_reveal.to_string());
            if let Some(graffiti) = graffiti {
                query.append_pair("graffiti", &graffiti.to_string());
            }
            if let Some(builder_boost_factor) = builder_boost_factor {
                query.append_pair("builder_boost_factor", &builder_boost_factor.to_string());
            }
        }

        let body: serde_json::Value = self
            .get_with_timeout(url, self.timeouts.proposal)
            .await?;

        let parse = |field: &str| -> Result<&serde_json::Value, Error> {
            body.get(field).ok_or_else(|| {
                Error::InvalidResponse(format!("produce block response missing {}", field))
            })
        };

        let version = parse("version")?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let blinded = match parse("execution_payload_blinded")? {
            serde_json::Value::Bool(blinded) => *blinded,
            serde_json::Value::String(s) => s == "true",
            _ => false,
        };
        let parse_value = |field: &str| -> Uint256 {
            body.get(field)
                .and_then(|v| v.as_str())
                .and_then(|s| Uint256::from_str_radix(s, 10).ok())
                .unwrap_or(Uint256::ZERO)
        };
        let execution_payload_value = parse_value("execution_payload_value");
        let consensus_block_value = parse_value("consensus_block_value");
        let data = parse("data")?.clone();

        let data = if blinded {
            ProduceBlockV3Data::Blinded(Box::new(
                serde_json::from_value(data)
                    .map_err(|e| Error::InvalidResponse(format!("blinded block: {}", e)))?,
            ))
        } else {
            ProduceBlockV3Data::Full(Box::new(
                serde_json::from_value(data)
                    .map_err(|e| Error::InvalidResponse(format!("full block: {}", e)))?,
            ))
        };

        Ok(ProduceBlockV3Response {
            version,
            data,
            execution_payload_value,
            consensus_block_value,
        })
    }

    /// `POST v2/beacon/blocks` as SSZ.
    pub async fn post_beacon_blocks_v2_ssz(
        &self,
        block_contents: &SignedBlockContents,
        fork_name: &str,
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v2", "beacon", "blocks"])?;
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(fork_name) {
            headers.insert(CONSENSUS_VERSION_HEADER, value);
        }
        self.post_ssz_with_headers(
            url,
            block_contents.as_ssz_bytes(),
            headers,
            self.timeouts.proposal,
        )
        .await
    }

    /// `POST v2/beacon/blocks` as JSON, the fallback for beacon nodes that
    /// reject SSZ bodies.
    pub async fn post_beacon_blocks_v2(
        &self,
        block_contents: &SignedBlockContents,
        fork_name: &str,
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v2", "beacon", "blocks"])?;
        let response = self
            .client
            .post(url)
            .timeout(self.timeouts.proposal)
            .header(CONSENSUS_VERSION_HEADER, fork_name)
            .json(block_contents)
            .send()
            .await?;
        self.ok_or_error(response).await?;
        Ok(())
    }

    /// `POST v2/beacon/blinded_blocks` as SSZ.
    pub async fn post_beacon_blinded_blocks_v2_ssz(
        &self,
        block: &SignedBlindedBeaconBlock,
        fork_name: &str,
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v2", "beacon", "blinded_blocks"])?;
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(fork_name) {
            headers.insert(CONSENSUS_VERSION_HEADER, value);
        }
        self.post_ssz_with_headers(url, block.as_ssz_bytes(), headers, self.timeouts.proposal)
            .await
    }

    /// `POST v2/beacon/blinded_blocks` as JSON.
    pub async fn post_beacon_blinded_blocks_v2(
        &self,
        block: &SignedBlindedBeaconBlock,
        fork_name: &str,
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v2", "beacon", "blinded_blocks"])?;
        let response = self
            .client
            .post(url)
            .timeout(self.timeouts.proposal)
            .header(CONSENSUS_VERSION_HEADER, fork_name)
            .json(block)
            .send()
            .await?;
        self.ok_or_error(response).await?;
        Ok(())
    }

    /// `POST beacon/pool/attestations`
    pub async fn post_beacon_pool_attestations(
        &self,
        attestations: &[Attestation],
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "beacon", "pool", "attestations"])?;
        self.post_with_timeout(url, &attestations, self.timeouts.attestation)
            .await
    }

    /// `POST validator/aggregate_and_proofs`
    pub async fn post_validator_aggregate_and_proof(
        &self,
        aggregates: &[SignedAggregateAndProof],
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "validator", "aggregate_and_proofs"])?;
        self.post_with_timeout(url, &aggregates, self.timeouts.aggregate)
            .await
    }

    /// `POST beacon/pool/sync_committees`
    pub async fn post_beacon_pool_sync_committees(
        &self,
        messages: &[SyncCommitteeMessage],
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "beacon", "pool", "sync_committees"])?;
        self.post_with_timeout(url, &messages, self.timeouts.attestation)
            .await
    }

    /// `GET validator/sync_committee_contribution`
    pub async fn get_validator_sync_committee_contribution(
        &self,
        slot: Slot,
        subcommittee_index: u64,
        beacon_block_root: Hash256,
    ) -> Result<Option<GenericResponse<SyncCommitteeContribution>>, Error> {
        let mut url = self.url(&["eth", "v1", "validator", "sync_committee_contribution"])?;
        url.query_pairs_mut()
            .append_pair("slot", &slot.to_string())
            .append_pair("subcommittee_index", &subcommittee_index.to_string())
            .append_pair("beacon_block_root", &format!("{:?}", beacon_block_root));
        self.get_opt(url, self.timeouts.sync_committee_contribution)
            .await
    }

    /// `POST validator/contribution_and_proofs`
    pub async fn post_validator_contribution_and_proofs(
        &self,
        contributions: &[SignedContributionAndProof],
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "validator", "contribution_and_proofs"])?;
        self.post_with_timeout(url, &contributions, self.timeouts.sync_committee_contribution)
            .await
    }

    /// `POST validator/register_validator`
    pub async fn post_validator_register_validator(
        &self,
        registrations: &[SignedValidatorRegistrationData],
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "validator", "register_validator"])?;
        self.post_with_timeout(url, &registrations, self.timeouts.default)
            .await
    }

    /// `POST validator/liveness/{epoch}`
    pub async fn post_validator_liveness_epoch(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GenericResponse<Vec<LivenessResponseData>>, Error> {
        let url = self.url(&["eth", "v1", "validator", "liveness", &epoch.to_string()])?;
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        self.post_with_response(url, &body, self.timeouts.liveness)
            .await
    }

    /// `POST beacon/pool/voluntary_exits`
    pub async fn post_beacon_pool_voluntary_exits(
        &self,
        exit: &SignedVoluntaryExit,
    ) -> Result<(), Error> {
        let url = self.url(&["eth", "v1", "beacon", "pool", "voluntary_exits"])?;
        self.post_with_timeout(url, exit, self.timeouts.default)
            .await
    }

    /// `GET events?topics=...`, surfaced as a stream of parsed events.
    ///
    /// Reconnection is left to the caller: the stream terminates on the
    /// first transport error so the event pipeline can apply its own
    /// backoff.
    pub fn get_events(
        &self,
        topics: &[EventTopic],
    ) -> Result<impl Stream<Item = Result<EventKind, Error>>, Error> {
        let mut url = self.url(&["eth", "v1", "events"])?;
        let topic_string = topics
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut().append_pair("topics", &topic_string);

        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream");
        let event_source = EventSource::new(request)
            .map_err(|e| Error::InvalidUrl(format!("cannot build event source: {}", e)))?;

        Ok(event_source.filter_map(|event| async move {
            match event {
                Ok(SseEvent::Open) => None,
                Ok(SseEvent::Message(message)) => {
                    Some(EventKind::from_sse_parts(&message.event, &message.data))
                }
                Err(reqwest_eventsource::Error::StreamEnded) => Some(Err(Error::EventStreamEnded)),
                Err(e) => Some(Err(Error::InvalidServerSentEvent(e.to_string()))),
            }
        }))
    }
}
