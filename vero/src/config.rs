use crate::cli::Cli;
use rand::RngCore;
use sensitive_url::SensitiveUrl;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use types::{Address, ChainSpec, Graffiti, GraffitiString};

pub const KEYMANAGER_TOKEN_FILE: &str = "keymanager-api-token.txt";
const DEFAULT_DATA_DIR: &str = ".vero";

/// The fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub spec: ChainSpec,
    pub beacon_node_urls: Vec<SensitiveUrl>,
    pub proposal_node_urls: Vec<SensitiveUrl>,
    pub attestation_consensus_threshold: usize,
    pub remote_signer_url: Option<SensitiveUrl>,
    pub fee_recipient: Option<Address>,
    pub data_dir: PathBuf,
    pub graffiti: Option<Graffiti>,
    pub gas_limit: Option<u64>,
    pub use_external_builder: bool,
    pub builder_boost_factor: u64,
    pub enable_doppelganger_detection: bool,
    pub enable_keymanager_api: bool,
    pub keymanager_api_token_file_path: PathBuf,
    pub keymanager_api_address: IpAddr,
    pub keymanager_api_port: u16,
    pub metrics_address: IpAddr,
    pub metrics_port: u16,
    pub log_level: String,
    pub ignore_spec_mismatch: bool,
    pub disable_slashing_detection: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, String> {
        let spec = match &cli.network_custom_config_path {
            Some(path) => ChainSpec::from_yaml_file(path)?,
            None => ChainSpec::from_network_name(&cli.network)?,
        };

        let parse_urls = |urls: &[String]| -> Result<Vec<SensitiveUrl>, String> {
            urls.iter()
                .map(|url| {
                    SensitiveUrl::from_str(url)
                        .map_err(|e| format!("Invalid beacon node URL {}: {}", url, e))
                })
                .collect()
        };
        let beacon_node_urls = parse_urls(&cli.beacon_node_urls)?;
        if beacon_node_urls.is_empty() {
            return Err("At least one beacon node URL is required".to_string());
        }
        let proposal_node_urls = parse_urls(&cli.beacon_node_urls_proposal)?;

        // A majority of the configured nodes, unless overridden.
        let attestation_consensus_threshold = cli
            .attestation_consensus_threshold
            .unwrap_or(beacon_node_urls.len() / 2 + 1);
        if attestation_consensus_threshold == 0
            || attestation_consensus_threshold > beacon_node_urls.len()
        {
            return Err(format!(
                "--attestation-consensus-threshold must be within [1, {}]",
                beacon_node_urls.len()
            ));
        }

        let remote_signer_url = cli
            .remote_signer_url
            .as_ref()
            .map(|url| {
                SensitiveUrl::from_str(url)
                    .map_err(|e| format!("Invalid remote signer URL: {}", e))
            })
            .transpose()?;

        let fee_recipient = cli
            .fee_recipient
            .as_ref()
            .map(|addr| {
                Address::from_str(addr).map_err(|e| format!("Invalid fee recipient: {}", e))
            })
            .transpose()?;

        let graffiti = cli
            .graffiti
            .as_ref()
            .map(|s| {
                GraffitiString::from_str(s)
                    .map(Graffiti::from)
                    .map_err(|e| format!("Invalid graffiti: {}", e))
            })
            .transpose()?;

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(DEFAULT_DATA_DIR)))
            .ok_or("Unable to determine a data directory; pass --data-dir")?;

        let keymanager_api_token_file_path = cli
            .keymanager_api_token_file_path
            .clone()
            .unwrap_or_else(|| data_dir.join(KEYMANAGER_TOKEN_FILE));

        Ok(Self {
            spec,
            beacon_node_urls,
            proposal_node_urls,
            attestation_consensus_threshold,
            remote_signer_url,
            fee_recipient,
            data_dir,
            graffiti,
            gas_limit: cli.gas_limit,
            use_external_builder: cli.use_external_builder,
            builder_boost_factor: cli.builder_boost_factor,
            enable_doppelganger_detection: cli.enable_doppelganger_detection,
            enable_keymanager_api: cli.enable_keymanager_api,
            keymanager_api_token_file_path,
            keymanager_api_address: cli.keymanager_api_address,
            keymanager_api_port: cli.keymanager_api_port,
            metrics_address: cli.metrics_address,
            metrics_port: cli.metrics_port,
            log_level: cli.log_level.clone(),
            ignore_spec_mismatch: cli.ignore_spec_mismatch,
            disable_slashing_detection: cli.disable_slashing_detection,
        })
    }
}

/// Loads the keymanager bearer token, generating a fresh 32-byte hex token
/// when the file does not exist.
pub fn load_or_generate_api_token(path: &Path) -> Result<String, String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)
            .map_err(|e| format!("Unable to read {}: {}", path.display(), e))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(format!("Token file {} is empty", path.display()));
        }
        return Ok(token);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Unable to create {}: {}", parent.display(), e))?;
    }
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    std::fs::write(path, &token)
        .map_err(|e| format!("Unable to write {}: {}", path.display(), e))?;
    info!(path = %path.display(), "Generated keymanager API token");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config_from(args: &[&str]) -> Config {
        let cli =
            Cli::try_parse_from(std::iter::once("vero").chain(args.iter().copied())).unwrap();
        Config::from_cli(&cli).unwrap()
    }

    #[test]
    fn threshold_defaults_to_majority() {
        let config = config_from(&[
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://a:5052,http://b:5052,http://c:5052",
        ]);
        assert_eq!(config.attestation_consensus_threshold, 2);

        let config = config_from(&[
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://a:5052,http://b:5052,http://c:5052,http://d:5052",
        ]);
        assert_eq!(config.attestation_consensus_threshold, 3);
    }

    #[test]
    fn threshold_override_is_validated() {
        let cli = Cli::try_parse_from([
            "vero",
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://a:5052,http://b:5052",
            "--attestation-consensus-threshold",
            "3",
        ])
        .unwrap();
        assert!(Config::from_cli(&cli).is_err());
    }

    #[test]
    fn operator_may_run_threshold_one() {
        let config = config_from(&[
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://a:5052,http://b:5052",
            "--attestation-consensus-threshold",
            "1",
        ]);
        assert_eq!(config.attestation_consensus_threshold, 1);
    }

    #[test]
    fn fee_recipient_parses() {
        let config = config_from(&[
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://a:5052",
            "--fee-recipient",
            "0x25c4a76E7d118705e7Ea2e9b7d8C59930d8aCD3b",
        ]);
        assert!(config.fee_recipient.is_some());
    }

    #[test]
    fn api_token_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYMANAGER_TOKEN_FILE);

        let token = load_or_generate_api_token(&path).unwrap();
        assert_eq!(token.len(), 64, "32 bytes, hex encoded");

        let reloaded = load_or_generate_api_token(&path).unwrap();
        assert_eq!(token, reloaded, "an existing token is reused");
    }
}
