use crate::{Epoch, Slot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// A fork version identifier.
pub type ForkVersion = [u8; 4];

/// The `Fork` object sent to the remote signer with every signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub previous_version: ForkVersion,
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub current_version: ForkVersion,
    pub epoch: Epoch,
}

/// Per-network constants.
///
/// Only the constants this client consults are kept; everything else the
/// standard `config.yaml` carries is ignored on load. The Ethereum and
/// Gnosis presets share every SSZ container maximum used here, so container
/// sizes are compile-time constants and only timing/fork values vary at
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub config_name: String,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    /// The number of "duty intervals" within a slot; attestations are due
    /// after one interval, aggregates after two.
    pub intervals_per_slot: u64,
    pub epochs_per_sync_committee_period: u64,
    pub sync_committee_size: u64,
    pub sync_committee_subnet_count: u64,
    pub target_aggregators_per_committee: u64,
    pub target_aggregators_per_sync_subcommittee: u64,
    pub genesis_fork_version: ForkVersion,
    pub altair_fork_version: ForkVersion,
    pub altair_fork_epoch: Option<Epoch>,
    pub bellatrix_fork_version: ForkVersion,
    pub bellatrix_fork_epoch: Option<Epoch>,
    pub capella_fork_version: ForkVersion,
    pub capella_fork_epoch: Option<Epoch>,
    pub deneb_fork_version: ForkVersion,
    pub deneb_fork_epoch: Option<Epoch>,
    pub far_future_epoch: Epoch,
}

impl ChainSpec {
    pub fn mainnet() -> Self {
        Self {
            config_name: "mainnet".to_string(),
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            intervals_per_slot: 3,
            epochs_per_sync_committee_period: 256,
            sync_committee_size: 512,
            sync_committee_subnet_count: 4,
            target_aggregators_per_committee: 16,
            target_aggregators_per_sync_subcommittee: 16,
            genesis_fork_version: [0, 0, 0, 0],
            altair_fork_version: [1, 0, 0, 0],
            altair_fork_epoch: Some(Epoch::new(74240)),
            bellatrix_fork_version: [2, 0, 0, 0],
            bellatrix_fork_epoch: Some(Epoch::new(144896)),
            capella_fork_version: [3, 0, 0, 0],
            capella_fork_epoch: Some(Epoch::new(194048)),
            deneb_fork_version: [4, 0, 0, 0],
            deneb_fork_epoch: Some(Epoch::new(269568)),
            far_future_epoch: Epoch::max_value(),
        }
    }

    pub fn gnosis() -> Self {
        Self {
            config_name: "gnosis".to_string(),
            seconds_per_slot: 5,
            slots_per_epoch: 16,
            epochs_per_sync_committee_period: 512,
            genesis_fork_version: [0, 0, 0, 0x64],
            altair_fork_version: [1, 0, 0, 0x64],
            altair_fork_epoch: Some(Epoch::new(512)),
            bellatrix_fork_version: [2, 0, 0, 0x64],
            bellatrix_fork_epoch: Some(Epoch::new(385536)),
            capella_fork_version: [3, 0, 0, 0x64],
            capella_fork_epoch: Some(Epoch::new(648704)),
            deneb_fork_version: [4, 0, 0, 0x64],
            deneb_fork_epoch: Some(Epoch::new(889856)),
            ..Self::mainnet()
        }
    }

    pub fn holesky() -> Self {
        Self {
            config_name: "holesky".to_string(),
            genesis_fork_version: [0x01, 0x01, 0x70, 0x00],
            altair_fork_version: [0x02, 0x01, 0x70, 0x00],
            altair_fork_epoch: Some(Epoch::new(0)),
            bellatrix_fork_version: [0x03, 0x01, 0x70, 0x00],
            bellatrix_fork_epoch: Some(Epoch::new(0)),
            capella_fork_version: [0x04, 0x01, 0x70, 0x00],
            capella_fork_epoch: Some(Epoch::new(256)),
            deneb_fork_version: [0x05, 0x01, 0x70, 0x00],
            deneb_fork_epoch: Some(Epoch::new(29696)),
            ..Self::mainnet()
        }
    }

    pub fn hoodi() -> Self {
        Self {
            config_name: "hoodi".to_string(),
            genesis_fork_version: [0x10, 0x00, 0x09, 0x10],
            altair_fork_version: [0x20, 0x00, 0x09, 0x10],
            altair_fork_epoch: Some(Epoch::new(0)),
            bellatrix_fork_version: [0x30, 0x00, 0x09, 0x10],
            bellatrix_fork_epoch: Some(Epoch::new(0)),
            capella_fork_version: [0x40, 0x00, 0x09, 0x10],
            capella_fork_epoch: Some(Epoch::new(0)),
            deneb_fork_version: [0x50, 0x00, 0x09, 0x10],
            deneb_fork_epoch: Some(Epoch::new(0)),
            ..Self::mainnet()
        }
    }

    pub fn from_network_name(name: &str) -> Result<Self, String> {
        match name {
            "mainnet" => Ok(Self::mainnet()),
            "gnosis" => Ok(Self::gnosis()),
            "holesky" => Ok(Self::holesky()),
            "hoodi" => Ok(Self::hoodi()),
            other => Err(format!("Unknown network name: {}", other)),
        }
    }

    /// Loads a spec from a standard `config.yaml`, starting from the
    /// mainnet preset for any field the file omits.
    pub fn from_yaml_file(path: &Path) -> Result<Self, String> {
        let file = std::fs::File::open(path)
            .map_err(|e| format!("Unable to open {}: {}", path.display(), e))?;
        let config: YamlConfig = serde_yaml::from_reader(file)
            .map_err(|e| format!("Unable to parse {}: {}", path.display(), e))?;
        config.apply_to(Self::mainnet())
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot)
    }

    /// One duty interval: `seconds_per_slot / intervals_per_slot`.
    pub fn interval_duration(&self) -> Duration {
        self.slot_duration() / self.intervals_per_slot as u32
    }

    pub fn epoch_duration(&self) -> Duration {
        self.slot_duration() * self.slots_per_epoch as u32
    }

    /// The fork version active at `epoch`.
    pub fn fork_version_at_epoch(&self, epoch: Epoch) -> ForkVersion {
        self.fork_schedule()
            .into_iter()
            .rev()
            .find(|(fork_epoch, _)| *fork_epoch <= epoch)
            .map(|(_, version)| version)
            .unwrap_or(self.genesis_fork_version)
    }

    /// The `Fork` object (previous/current version pair) active at `epoch`.
    pub fn fork_at_epoch(&self, epoch: Epoch) -> Fork {
        let schedule = self.fork_schedule();
        let mut previous_version = self.genesis_fork_version;
        let mut current_version = self.genesis_fork_version;
        let mut fork_epoch = Epoch::new(0);
        for (activation, version) in schedule {
            if activation <= epoch {
                previous_version = current_version;
                current_version = version;
                fork_epoch = activation;
            }
        }
        Fork {
            previous_version,
            current_version,
            epoch: fork_epoch,
        }
    }

    /// The lowercase fork name used in `Eth-Consensus-Version` headers.
    pub fn fork_name_at_epoch(&self, epoch: Epoch) -> &'static str {
        let activated = |fork_epoch: Option<Epoch>| fork_epoch.is_some_and(|e| e <= epoch);
        if activated(self.deneb_fork_epoch) {
            "deneb"
        } else if activated(self.capella_fork_epoch) {
            "capella"
        } else if activated(self.bellatrix_fork_epoch) {
            "bellatrix"
        } else if activated(self.altair_fork_epoch) {
            "altair"
        } else {
            "phase0"
        }
    }

    fn fork_schedule(&self) -> Vec<(Epoch, ForkVersion)> {
        let mut schedule = vec![(Epoch::new(0), self.genesis_fork_version)];
        for (epoch, version) in [
            (self.altair_fork_epoch, self.altair_fork_version),
            (self.bellatrix_fork_epoch, self.bellatrix_fork_version),
            (self.capella_fork_epoch, self.capella_fork_version),
            (self.deneb_fork_epoch, self.deneb_fork_version),
        ] {
            if let Some(epoch) = epoch {
                schedule.push((epoch, version));
            }
        }
        schedule
    }

    /// The epoch in which `slot`'s sync committee period began.
    pub fn sync_committee_period_start_epoch(&self, slot: Slot) -> Epoch {
        let epoch = slot.epoch(self.slots_per_epoch);
        let period = epoch.sync_committee_period(self.epochs_per_sync_committee_period);
        Epoch::new(period * self.epochs_per_sync_committee_period)
    }

    /// Compares this spec against the key/value map a beacon node reports
    /// from `/eth/v1/config/spec`. Returns the mismatching keys.
    pub fn compatibility_errors(&self, remote: &HashMap<String, String>) -> Vec<String> {
        let mut errors = vec![];
        let mut check = |key: &str, local: String| {
            if let Some(remote_value) = remote.get(key) {
                if !remote_value.eq_ignore_ascii_case(&local) {
                    errors.push(format!(
                        "{}: ours {} theirs {}",
                        key, local, remote_value
                    ));
                }
            }
        };
        check("SECONDS_PER_SLOT", self.seconds_per_slot.to_string());
        check("SLOTS_PER_EPOCH", self.slots_per_epoch.to_string());
        check(
            "GENESIS_FORK_VERSION",
            format!("0x{}", hex::encode(self.genesis_fork_version)),
        );
        for (key, version, epoch) in [
            (
                "ALTAIR",
                self.altair_fork_version,
                self.altair_fork_epoch,
            ),
            (
                "BELLATRIX",
                self.bellatrix_fork_version,
                self.bellatrix_fork_epoch,
            ),
            (
                "CAPELLA",
                self.capella_fork_version,
                self.capella_fork_epoch,
            ),
            ("DENEB", self.deneb_fork_version, self.deneb_fork_epoch),
        ] {
            check(
                &format!("{}_FORK_VERSION", key),
                format!("0x{}", hex::encode(version)),
            );
            if let Some(epoch) = epoch {
                check(&format!("{}_FORK_EPOCH", key), epoch.as_u64().to_string());
            }
        }
        errors
    }
}

/// The subset of the standard YAML config format this client reads.
#[derive(Debug, Clone, Deserialize)]
struct YamlConfig {
    #[serde(rename = "CONFIG_NAME")]
    config_name: Option<String>,
    #[serde(rename = "SECONDS_PER_SLOT")]
    seconds_per_slot: Option<u64>,
    #[serde(rename = "SLOTS_PER_EPOCH")]
    slots_per_epoch: Option<u64>,
    #[serde(rename = "EPOCHS_PER_SYNC_COMMITTEE_PERIOD")]
    epochs_per_sync_committee_period: Option<u64>,
    #[serde(rename = "GENESIS_FORK_VERSION")]
    genesis_fork_version: Option<String>,
    #[serde(rename = "ALTAIR_FORK_VERSION")]
    altair_fork_version: Option<String>,
    #[serde(rename = "ALTAIR_FORK_EPOCH")]
    altair_fork_epoch: Option<u64>,
    #[serde(rename = "BELLATRIX_FORK_VERSION")]
    bellatrix_fork_version: Option<String>,
    #[serde(rename = "BELLATRIX_FORK_EPOCH")]
    bellatrix_fork_epoch: Option<u64>,
    #[serde(rename = "CAPELLA_FORK_VERSION")]
    capella_fork_version: Option<String>,
    #[serde(rename = "CAPELLA_FORK_EPOCH")]
    capella_fork_epoch: Option<u64>,
    #[serde(rename = "DENEB_FORK_VERSION")]
    deneb_fork_version: Option<String>,
    #[serde(rename = "DENEB_FORK_EPOCH")]
    deneb_fork_epoch: Option<u64>,
}

fn parse_fork_version(s: &str) -> Result<ForkVersion, String> {
    let stripped = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("Fork version {} must start with 0x", s))?;
    let bytes = hex::decode(stripped).map_err(|e| format!("Invalid fork version hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|_| format!("Fork version {} must be 4 bytes", s))
}

impl YamlConfig {
    fn apply_to(self, mut spec: ChainSpec) -> Result<ChainSpec, String> {
        if let Some(name) = self.config_name {
            spec.config_name = name;
        }
        if let Some(v) = self.seconds_per_slot {
            spec.seconds_per_slot = v;
        }
        if let Some(v) = self.slots_per_epoch {
            spec.slots_per_epoch = v;
        }
        if let Some(v) = self.epochs_per_sync_committee_period {
            spec.epochs_per_sync_committee_period = v;
        }
        if let Some(v) = &self.genesis_fork_version {
            spec.genesis_fork_version = parse_fork_version(v)?;
        }
        if let Some(v) = &self.altair_fork_version {
            spec.altair_fork_version = parse_fork_version(v)?;
        }
        if let Some(v) = self.altair_fork_epoch {
            spec.altair_fork_epoch = Some(Epoch::new(v));
        }
        if let Some(v) = &self.bellatrix_fork_version {
            spec.bellatrix_fork_version = parse_fork_version(v)?;
        }
        if let Some(v) = self.bellatrix_fork_epoch {
            spec.bellatrix_fork_epoch = Some(Epoch::new(v));
        }
        if let Some(v) = &self.capella_fork_version {
            spec.capella_fork_version = parse_fork_version(v)?;
        }
        if let Some(v) = self.capella_fork_epoch {
            spec.capella_fork_epoch = Some(Epoch::new(v));
        }
        if let Some(v) = &self.deneb_fork_version {
            spec.deneb_fork_version = parse_fork_version(v)?;
        }
        if let Some(v) = self.deneb_fork_epoch {
            spec.deneb_fork_epoch = Some(Epoch::new(v));
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_fork_lookup() {
        let spec = ChainSpec::mainnet();
        assert_eq!(
            spec.fork_version_at_epoch(Epoch::new(0)),
            spec.genesis_fork_version
        );
        assert_eq!(
            spec.fork_version_at_epoch(Epoch::new(74240)),
            spec.altair_fork_version
        );
        assert_eq!(
            spec.fork_version_at_epoch(Epoch::new(300000)),
            spec.deneb_fork_version
        );
    }

    #[test]
    fn fork_object_carries_previous_version() {
        let spec = ChainSpec::mainnet();
        let fork = spec.fork_at_epoch(Epoch::new(150000));
        assert_eq!(fork.previous_version, spec.altair_fork_version);
        assert_eq!(fork.current_version, spec.bellatrix_fork_version);
        assert_eq!(fork.epoch, Epoch::new(144896));
    }

    #[test]
    fn gnosis_timing_differs() {
        let spec = ChainSpec::gnosis();
        assert_eq!(spec.seconds_per_slot, 5);
        assert_eq!(spec.slots_per_epoch, 16);
        assert_eq!(spec.epochs_per_sync_committee_period, 512);
    }

    #[test]
    fn compatibility_check_flags_mismatch() {
        let spec = ChainSpec::mainnet();
        let mut remote = HashMap::new();
        remote.insert("SECONDS_PER_SLOT".to_string(), "12".to_string());
        remote.insert("SLOTS_PER_EPOCH".to_string(), "16".to_string());
        let errors = spec.compatibility_errors(&remote);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("SLOTS_PER_EPOCH"));
    }

    #[test]
    fn compatibility_check_ignores_absent_keys() {
        let spec = ChainSpec::mainnet();
        assert!(spec.compatibility_errors(&HashMap::new()).is_empty());
    }
}
