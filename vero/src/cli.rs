use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// A multi-node Ethereum/Gnosis validator client: it performs duties for
/// a set of validators while cross-checking the view of the chain across
/// several independent beacon nodes, with all keys held by a remote
/// signer.
#[derive(Debug, Clone, Parser)]
#[command(name = "vero", author, version, about)]
pub struct Cli {
    /// The network to operate on.
    #[arg(
        long,
        value_name = "NETWORK",
        default_value = "mainnet",
        conflicts_with = "network_custom_config_path"
    )]
    pub network: String,

    /// Path to a custom network config.yaml; overrides --network.
    #[arg(long, value_name = "PATH")]
    pub network_custom_config_path: Option<PathBuf>,

    /// URL of the remote signer holding the validator keys.
    #[arg(
        long,
        value_name = "URL",
        conflicts_with = "enable_keymanager_api",
        required_unless_present = "enable_keymanager_api"
    )]
    pub remote_signer_url: Option<String>,

    /// Comma-separated list of beacon node URLs.
    #[arg(long, value_name = "URLS", value_delimiter = ',', required = true)]
    pub beacon_node_urls: Vec<String>,

    /// Comma-separated list of beacon node URLs used exclusively for block
    /// proposals. Defaults to --beacon-node-urls.
    #[arg(long, value_name = "URLS", value_delimiter = ',')]
    pub beacon_node_urls_proposal: Vec<String>,

    /// Number of beacon nodes that must agree on attestation data before
    /// it is signed. Defaults to a majority of the configured nodes.
    #[arg(long, value_name = "COUNT")]
    pub attestation_consensus_threshold: Option<usize>,

    /// The default fee recipient for block proposals.
    #[arg(long, value_name = "ADDRESS")]
    pub fee_recipient: Option<String>,

    /// Where vero keeps its persistent state.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Default graffiti for proposed blocks (UTF-8, at most 32 bytes).
    #[arg(long, value_name = "GRAFFITI")]
    pub graffiti: Option<String>,

    /// Default gas limit for registered validators.
    #[arg(long, value_name = "GAS_LIMIT")]
    pub gas_limit: Option<u64>,

    /// Register managed validators with external builders and consider
    /// externally-built blocks during proposals.
    #[arg(long)]
    pub use_external_builder: bool,

    /// Percentage multiplier applied to externally-built block values when
    /// comparing them against locally-built blocks.
    #[arg(long, value_name = "PERCENT", default_value_t = 100)]
    pub builder_boost_factor: u64,

    /// Observe the network for doppelgangers for three epochs before
    /// signing anything.
    #[arg(long)]
    pub enable_doppelganger_detection: bool,

    /// Enable the keymanager API; validator keys are then managed through
    /// it rather than discovered from the remote signer.
    #[arg(long)]
    pub enable_keymanager_api: bool,

    /// Path to the keymanager API bearer token file. Defaults to
    /// `<data-dir>/keymanager-api-token.txt`.
    #[arg(long, value_name = "PATH")]
    pub keymanager_api_token_file_path: Option<PathBuf>,

    /// Listen address for the keymanager API.
    #[arg(long, value_name = "ADDRESS", default_value = "127.0.0.1")]
    pub keymanager_api_address: IpAddr,

    /// Listen port for the keymanager API.
    #[arg(long, value_name = "PORT", default_value_t = 8001)]
    pub keymanager_api_port: u16,

    /// Listen address for the metrics server.
    #[arg(long, value_name = "ADDRESS", default_value = "127.0.0.1")]
    pub metrics_address: IpAddr,

    /// Listen port for the metrics server.
    #[arg(long, value_name = "PORT", default_value_t = 8000)]
    pub metrics_port: u16,

    /// Log verbosity: trace, debug, info, warn or error.
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Keep using a beacon node whose reported spec differs from ours.
    #[arg(long)]
    pub ignore_spec_mismatch: bool,

    /// Disables the inputs of the slashing detector. The safety latch
    /// itself stays wired. Do not use this unless you fully understand the
    /// consequences.
    #[arg(long = "DANGER----disable-slashing-detection", hide = true)]
    pub disable_slashing_detection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(
            std::iter::once("vero").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn minimal_invocation() {
        let cli = parse(&[
            "--remote-signer-url",
            "http://localhost:9000",
            "--beacon-node-urls",
            "http://localhost:5052,http://localhost:5053,http://localhost:5054",
        ]);
        assert_eq!(cli.beacon_node_urls.len(), 3);
        assert_eq!(cli.network, "mainnet");
        assert_eq!(cli.builder_boost_factor, 100);
        assert!(!cli.disable_slashing_detection);
    }

    #[test]
    fn signer_url_and_keymanager_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "vero",
            "--remote-signer-url",
            "http://localhost:9000",
            "--enable-keymanager-api",
            "--beacon-node-urls",
            "http://localhost:5052",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn one_of_signer_url_or_keymanager_is_required() {
        let result =
            Cli::try_parse_from(["vero", "--beacon-node-urls", "http://localhost:5052"]);
        assert!(result.is_err());
    }

    #[test]
    fn danger_flag_has_the_shouting_prefix() {
        let cli = parse(&[
            "--enable-keymanager-api",
            "--beacon-node-urls",
            "http://localhost:5052",
            "--DANGER----disable-slashing-detection",
        ]);
        assert!(cli.disable_slashing_detection);
    }
}
