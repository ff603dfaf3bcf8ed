//! The client's gateway to the remote signer.
//!
//! Every private-key operation in the process goes through
//! [`RemoteSigner::sign`]. Requests carry a discriminated payload naming
//! the signing domain; the signer computes the signing root itself from
//! the payload and fork info, so no signing-root derivation happens here.
//!
//! A refusal (any 4xx, notably 412 from the signer's slashing protection)
//! is surfaced as [`Error::Refused`] and must never be retried with the
//! same payload.

mod web3signer;

use sensitive_url::SensitiveUrl;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;
use types::{Fork, Hash256, PublicKeyBytes, SignatureBytes};

pub use web3signer::{
    AggregationSlot, BlockRequest, ForkInfo, RandaoReveal, SyncCommitteeMessageData,
    Web3SignerObject,
};

/// Scores live in `[MIN_SCORE, MAX_SCORE]`; a fresh signer starts at max.
const MAX_SCORE: i64 = 100;
const MIN_SCORE: i64 = 0;

/// The outcome of one call to the signer, ordered worst-first so that
/// `Ord` ranks healthier outcomes higher — the same classes the
/// beacon-node coordinator scores with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
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

    fn from_transport_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Outcome::Timeout
        } else if error.is_connect() {
            Outcome::ConnectionRefused
        } else {
            Outcome::ServerError
        }
    }

    /// Classifies a completed round trip: responses slower than
    /// `slow_cutoff` still succeed, but rank below prompt ones.
    fn from_elapsed(elapsed: Duration, slow_cutoff: Duration) -> Self {
        if elapsed <= slow_cutoff {
            Outcome::Success
        } else {
            Outcome::SlowSuccess
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Error {
    /// The signer could not be reached (connect, timeout, transport).
    SignerUnreachable(String),
    /// The signer understood the request and refused it. Refusals are a
    /// safety stop: the same payload must not be submitted again.
    Refused { status: u16, message: String },
    /// The signer failed internally; the operation may be retried with a
    /// different payload or after backoff.
    ServerError { status: u16, message: String },
    InvalidResponse(String),
    InvalidUrl(String),
}

impl Error {
    pub fn is_refusal(&self) -> bool {
        matches!(self, Error::Refused { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Deserialize)]
struct SignatureResponse {
    signature: SignatureBytes,
}

/// A client for one remote signer.
pub struct RemoteSigner {
    client: reqwest::Client,
    server: SensitiveUrl,
    request_timeout: Duration,
    score: AtomicI64,
}

impl fmt::Display for RemoteSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server)
    }
}

impl RemoteSigner {
    pub fn new(server: SensitiveUrl, request_timeout: Duration) -> Self {
        let signer = Self {
            client: reqwest::Client::new(),
            server,
            request_timeout,
            score: AtomicI64::new(MAX_SCORE),
        };
        signer.publish_score();
        signer
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::Relaxed)
    }

    fn publish_score(&self) {
        metrics::set_gauge(&validator_metrics::REMOTE_SIGNER_SCORE, self.score());
    }

    fn record_outcome(&self, outcome: Outcome) {
        let previous = self.score.load(Ordering::Relaxed);
        let updated = (previous + outcome.score_delta()).clamp(MIN_SCORE, MAX_SCORE);
        self.score.store(updated, Ordering::Relaxed);
        self.publish_score();
    }

    /// A call slower than this still succeeds, but marks the signer as
    /// slow.
    fn slow_cutoff(&self) -> Duration {
        self.request_timeout / 2
    }

    fn url(&self, path: &[&str]) -> Result<reqwest::Url, Error> {
        let mut url = self.server.full.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.to_string()))?
            .extend(path);
        Ok(url)
    }

    /// `GET /upcheck`
    pub async fn upcheck(&self) -> Result<(), Error> {
        let url = self.url(&["upcheck"])?;
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                self.record_outcome(Outcome::from_transport_error(&e));
                Error::SignerUnreachable(e.to_string())
            })?;
        if response.status().is_success() {
            self.record_outcome(Outcome::from_elapsed(start.elapsed(), self.slow_cutoff()));
            Ok(())
        } else {
            self.record_outcome(Outcome::ServerError);
            Err(Error::ServerError {
                status: response.status().as_u16(),
                message: "upcheck failed".to_string(),
            })
        }
    }

    /// `GET /api/v1/eth2/publicKeys`
    pub async fn list_public_keys(&self) -> Result<Vec<PublicKeyBytes>, Error> {
        let url = self.url(&["api", "v1", "eth2", "publicKeys"])?;
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                self.record_outcome(Outcome::from_transport_error(&e));
                Error::SignerUnreachable(e.to_string())
            })?;
        if !response.status().is_success() {
            self.record_outcome(Outcome::ServerError);
            return Err(Error::ServerError {
                status: response.status().as_u16(),
                message: "unable to list public keys".to_string(),
            });
        }
        self.record_outcome(Outcome::from_elapsed(start.elapsed(), self.slow_cutoff()));
        response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }

    /// `POST /api/v1/eth2/sign/{pubkey}`
    ///
    /// `fork_info` is attached for every consensus domain; registration
    /// requests (application domain) pass `None`.
    pub async fn sign(
        &self,
        pubkey: &PublicKeyBytes,
        object: Web3SignerObject<'_>,
        fork_info: Option<ForkInfo>,
    ) -> Result<SignatureBytes, Error> {
        let message_kind = object.message_kind();
        let url = self.url(&["api", "v1", "eth2", "sign", &pubkey.as_hex_string()])?;
        let body = web3signer::SigningRequest {
            fork_info,
            signing_root: None,
            object,
        };

        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.record_outcome(Outcome::from_transport_error(&e));
                metrics::inc_counter_vec(
                    &validator_metrics::SIGNED_MESSAGES_TOTAL,
                    &[message_kind, "unreachable"],
                );
                Error::SignerUnreachable(e.to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            // A refusal is a responsive signer enforcing its slashing
            // protection; it counts as a timely round trip for health and
            // surfaces only through the error.
            self.record_outcome(Outcome::from_elapsed(start.elapsed(), self.slow_cutoff()));
            metrics::inc_counter_vec(
                &validator_metrics::SIGNED_MESSAGES_TOTAL,
                &[message_kind, "refused"],
            );
            let message = response.text().await.unwrap_or_default();
            debug!(
                status = status.as_u16(),
                kind = message_kind,
                "Remote signer refused to sign"
            );
            return Err(Error::Refused {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            self.record_outcome(Outcome::ServerError);
            metrics::inc_counter_vec(
                &validator_metrics::SIGNED_MESSAGES_TOTAL,
                &[message_kind, "server_error"],
            );
            let message = response.text().await.unwrap_or_default();
            return Err(Error::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        self.record_outcome(Outcome::from_elapsed(start.elapsed(), self.slow_cutoff()));
        metrics::inc_counter_vec(
            &validator_metrics::SIGNED_MESSAGES_TOTAL,
            &[message_kind, "success"],
        );

        // Web3Signer responds with JSON when asked to, but the upstream API
        // documents a plain-text signature; accept both.
        let text = response
            .text()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        if let Ok(parsed) = serde_json::from_str::<SignatureResponse>(&text) {
            return Ok(parsed.signature);
        }
        text.trim()
            .parse()
            .map_err(|e| Error::InvalidResponse(format!("bad signature: {:?}", e)))
    }

    /// Builds the fork info object for a signing request at `epoch`.
    pub fn fork_info(fork: Fork, genesis_validators_root: Hash256) -> ForkInfo {
        ForkInfo {
            fork,
            genesis_validators_root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn signer() -> RemoteSigner {
        RemoteSigner::new(
            SensitiveUrl::from_str("http://localhost:9000").unwrap(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn outcome_ordering_matches_beacon_node_scoring() {
        assert!(Outcome::Success > Outcome::SlowSuccess);
        assert!(Outcome::SlowSuccess > Outcome::Timeout);
        assert!(Outcome::Timeout > Outcome::ServerError);
        assert!(Outcome::ServerError > Outcome::ConnectionRefused);
    }

    #[test]
    fn slow_responses_rank_below_prompt_ones() {
        let cutoff = Duration::from_millis(500);
        assert_eq!(
            Outcome::from_elapsed(Duration::from_millis(100), cutoff),
            Outcome::Success
        );
        assert_eq!(
            Outcome::from_elapsed(Duration::from_millis(900), cutoff),
            Outcome::SlowSuccess
        );
        assert!(
            Outcome::SlowSuccess.score_delta() < Outcome::Success.score_delta(),
            "a slow success recovers the score more slowly"
        );
        assert!(Outcome::SlowSuccess.score_delta() > 0);
    }

    #[test]
    fn score_recovers_and_clamps() {
        let signer = signer();
        assert_eq!(signer.score(), MAX_SCORE);
        signer.record_outcome(Outcome::ConnectionRefused);
        signer.record_outcome(Outcome::Timeout);
        assert_eq!(
            signer.score(),
            MAX_SCORE
                + Outcome::ConnectionRefused.score_delta()
                + Outcome::Timeout.score_delta()
        );
        for _ in 0..100 {
            signer.record_outcome(Outcome::Success);
        }
        assert_eq!(signer.score(), MAX_SCORE, "score must clamp at max");
        for _ in 0..100 {
            signer.record_outcome(Outcome::ConnectionRefused);
        }
        assert_eq!(signer.score(), MIN_SCORE, "score must clamp at min");
    }

    #[test]
    fn successes_never_lower_the_score() {
        let signer = signer();
        signer.record_outcome(Outcome::ServerError);
        let degraded = signer.score();
        signer.record_outcome(Outcome::SlowSuccess);
        assert!(signer.score() >= degraded);
        signer.record_outcome(Outcome::Success);
        assert!(signer.score() >= degraded);
    }

    #[test]
    fn refusal_is_not_a_transport_error() {
        let refused = Error::Refused {
            status: 412,
            message: "slashable".to_string(),
        };
        assert!(refused.is_refusal());
        assert!(!Error::SignerUnreachable("x".to_string()).is_refusal());
    }
}
