//! The set of validators managed by this client.
//!
//! Records are keyed by pubkey. Chain-assigned indices and statuses are
//! refreshed once per epoch from the beacon nodes; per-validator overrides
//! (fee recipient, gas limit, graffiti) are mutated atomically by the
//! keymanager collaborator. Reads hand out copies, so callers never hold
//! the lock across an await point.

use eth2::types::{ValidatorData, ValidatorStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use types::{Address, Graffiti, PublicKeyBytes};

pub const REMOTE_KEYS_FILE: &str = "remote_keys.json";

#[derive(Debug)]
pub enum Error {
    /// The chain reported a different index for a key that already has one.
    /// The existing binding is kept; this error is for reporting only.
    IndexReassigned {
        pubkey: PublicKeyBytes,
        existing: u64,
        reported: u64,
    },
    UnknownPubkey(PublicKeyBytes),
    DuplicatePubkey(PublicKeyBytes),
    UnableToPersist(String),
}

/// A remote-key entry as persisted in `remote_keys.json` for keymanager
/// mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteKeyEntry {
    pub pubkey: PublicKeyBytes,
    /// Per-key signer URL override; `None` uses the process-wide signer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
}

/// One managed validator.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorRecord {
    pub pubkey: PublicKeyBytes,
    pub index: Option<u64>,
    pub status: ValidatorStatus,
    pub fee_recipient: Option<Address>,
    pub gas_limit: Option<u64>,
    pub graffiti: Option<Graffiti>,
    /// Per-key signer URL from the remote-key registry, when running in
    /// keymanager mode.
    pub signer_url: Option<String>,
    /// Keys added through the keymanager after startup bypass the
    /// doppelganger guard for this process lifetime.
    pub added_at_runtime: bool,
}

impl ValidatorRecord {
    fn new(pubkey: PublicKeyBytes, added_at_runtime: bool) -> Self {
        Self {
            pubkey,
            index: None,
            status: ValidatorStatus::Unknown,
            fee_recipient: None,
            gas_limit: None,
            graffiti: None,
            signer_url: None,
            added_at_runtime,
        }
    }
}

/// The outcome of an epoch status refresh.
#[derive(Debug, Default, PartialEq)]
pub struct RefreshOutcome {
    pub new_indices: usize,
    /// Keys the chain now reports under a `*_slashed` status.
    pub slashed: Vec<PublicKeyBytes>,
    pub errors: Vec<String>,
}

pub struct ValidatorRegistry {
    validators: RwLock<HashMap<PublicKeyBytes, ValidatorRecord>>,
    /// Where the remote-key registry is persisted, when keymanager mode is
    /// enabled.
    persist_path: Option<PathBuf>,
}

impl ValidatorRegistry {
    pub fn new(initial_pubkeys: Vec<PublicKeyBytes>) -> Self {
        let validators = initial_pubkeys
            .into_iter()
            .map(|pubkey| (pubkey, ValidatorRecord::new(pubkey, false)))
            .collect();
        Self {
            validators: RwLock::new(validators),
            persist_path: None,
        }
    }

    /// Loads the persisted remote-key registry, creating an empty one when
    /// the file does not exist yet.
    pub fn from_remote_keys_file(data_dir: &std::path::Path) -> Result<Self, Error> {
        let path = data_dir.join(REMOTE_KEYS_FILE);
        let entries: Vec<RemoteKeyEntry> = if path.exists() {
            let file = std::fs::File::open(&path)
                .map_err(|e| Error::UnableToPersist(format!("open {}: {}", path.display(), e)))?;
            serde_json::from_reader(file)
                .map_err(|e| Error::UnableToPersist(format!("parse {}: {}", path.display(), e)))?
        } else {
            vec![]
        };

        info!(
            count = entries.len(),
            path = %path.display(),
            "Loaded remote key registry"
        );

        let validators = entries
            .into_iter()
            .map(|entry| {
                let mut record = ValidatorRecord::new(entry.pubkey, false);
                record.signer_url = entry.url;
                (entry.pubkey, record)
            })
            .collect();
        Ok(Self {
            validators: RwLock::new(validators),
            persist_path: Some(path),
        })
    }

    /// Inserts the startup key set discovered from the remote signer.
    pub fn seed(&self, pubkeys: Vec<PublicKeyBytes>) {
        let mut validators = self.validators.write();
        for pubkey in pubkeys {
            validators
                .entry(pubkey)
                .or_insert_with(|| ValidatorRecord::new(pubkey, false));
        }
    }

    /// The signer URL shared by the persisted remote keys, if any record
    /// carries one.
    pub fn remote_signer_url(&self) -> Option<String> {
        self.validators
            .read()
            .values()
            .find_map(|record| record.signer_url.clone())
    }

    pub fn num_validators(&self) -> usize {
        self.validators.read().len()
    }

    pub fn pubkeys(&self) -> Vec<PublicKeyBytes> {
        self.validators.read().keys().copied().collect()
    }

    /// Copy-on-read snapshot of every record.
    pub fn snapshot(&self) -> Vec<ValidatorRecord> {
        self.validators.read().values().cloned().collect()
    }

    pub fn record(&self, pubkey: &PublicKeyBytes) -> Option<ValidatorRecord> {
        self.validators.read().get(pubkey).cloned()
    }

    pub fn index_of(&self, pubkey: &PublicKeyBytes) -> Option<u64> {
        self.validators.read().get(pubkey)?.index
    }

    /// Every known `(pubkey, index)` pair.
    pub fn indexed_pubkeys(&self) -> Vec<(PublicKeyBytes, u64)> {
        self.validators
            .read()
            .values()
            .filter_map(|v| Some((v.pubkey, v.index?)))
            .collect()
    }

    pub fn indices(&self) -> Vec<u64> {
        self.validators
            .read()
            .values()
            .filter_map(|v| v.index)
            .collect()
    }

    /// `true` if any managed validator owns `index`.
    pub fn contains_index(&self, index: u64) -> bool {
        self.validators
            .read()
            .values()
            .any(|v| v.index == Some(index))
    }

    /// Applies the chain's view of index and status for each record.
    ///
    /// A known index is never re-bound: if the chain reports a different
    /// index for an already-indexed key, the existing binding is kept and
    /// the conflict reported.
    pub fn apply_chain_view(&self, chain_data: Vec<ValidatorData>) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        let mut validators = self.validators.write();

        for data in chain_data {
            let Some(record) = validators.get_mut(&data.validator.pubkey) else {
                continue;
            };

            match record.index {
                None => {
                    record.index = Some(data.index);
                    outcome.new_indices += 1;
                    debug!(
                        pubkey = ?record.pubkey,
                        index = data.index,
                        "Validator index discovered"
                    );
                }
                Some(existing) if existing != data.index => {
                    warn!(
                        pubkey = ?record.pubkey,
                        existing,
                        reported = data.index,
                        "Chain reported a conflicting validator index"
                    );
                    outcome.errors.push(format!(
                        "index conflict for {:?}: {} vs {}",
                        record.pubkey, existing, data.index
                    ));
                    continue;
                }
                Some(_) => {}
            }

            let was_slashed = record.status.is_slashed();
            record.status = data.status;
            if data.status.is_slashed() && !was_slashed {
                outcome.slashed.push(record.pubkey);
            }
        }

        // Export per-status counts while still holding the lock so the
        // metric is a consistent snapshot.
        let mut counts: HashMap<ValidatorStatus, i64> = HashMap::new();
        for record in validators.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        drop(validators);
        for (status, count) in counts {
            metrics::set_gauge_vec(
                &validator_metrics::VALIDATOR_COUNT,
                &[&status.to_string()],
                count,
            );
        }

        outcome
    }

    /// Adds keys through the keymanager collaborator. Existing keys are
    /// reported as duplicates and left untouched.
    pub fn add_remote_keys(
        &self,
        entries: Vec<RemoteKeyEntry>,
    ) -> Result<Vec<Result<PublicKeyBytes, Error>>, Error> {
        let mut results = Vec::with_capacity(entries.len());
        {
            let mut validators = self.validators.write();
            for entry in &entries {
                if validators.contains_key(&entry.pubkey) {
                    results.push(Err(Error::DuplicatePubkey(entry.pubkey)));
                } else {
                    let mut record = ValidatorRecord::new(entry.pubkey, true);
                    record.signer_url = entry.url.clone();
                    validators.insert(entry.pubkey, record);
                    results.push(Ok(entry.pubkey));
                }
            }
        }
        self.persist()?;
        Ok(results)
    }

    /// Removes keys through the keymanager collaborator.
    pub fn delete_remote_keys(
        &self,
        pubkeys: &[PublicKeyBytes],
    ) -> Result<Vec<Result<PublicKeyBytes, Error>>, Error> {
        let mut results = Vec::with_capacity(pubkeys.len());
        {
            let mut validators = self.validators.write();
            for pubkey in pubkeys {
                if validators.remove(pubkey).is_some() {
                    results.push(Ok(*pubkey));
                } else {
                    results.push(Err(Error::UnknownPubkey(*pubkey)));
                }
            }
        }
        self.persist()?;
        Ok(results)
    }

    pub fn set_fee_recipient(
        &self,
        pubkey: &PublicKeyBytes,
        fee_recipient: Option<Address>,
    ) -> Result<(), Error> {
        self.mutate(pubkey, |record| record.fee_recipient = fee_recipient)
    }

    pub fn set_gas_limit(
        &self,
        pubkey: &PublicKeyBytes,
        gas_limit: Option<u64>,
    ) -> Result<(), Error> {
        self.mutate(pubkey, |record| record.gas_limit = gas_limit)
    }

    pub fn set_graffiti(
        &self,
        pubkey: &PublicKeyBytes,
        graffiti: Option<Graffiti>,
    ) -> Result<(), Error> {
        self.mutate(pubkey, |record| record.graffiti = graffiti)
    }

    fn mutate(
        &self,
        pubkey: &PublicKeyBytes,
        f: impl FnOnce(&mut ValidatorRecord),
    ) -> Result<(), Error> {
        let mut validators = self.validators.write();
        let record = validators
            .get_mut(pubkey)
            .ok_or(Error::UnknownPubkey(*pubkey))?;
        f(record);
        Ok(())
    }

    fn persist(&self) -> Result<(), Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let entries: Vec<RemoteKeyEntry> = self
            .validators
            .read()
            .values()
            .map(|record| RemoteKeyEntry {
                pubkey: record.pubkey,
                url: record.signer_url.clone(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| Error::UnableToPersist(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| Error::UnableToPersist(format!("write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Epoch, Hash256, Validator};

    fn pubkey(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes::deserialize(&[byte; 48]).unwrap()
    }

    fn chain_data(pubkey: PublicKeyBytes, index: u64, status: ValidatorStatus) -> ValidatorData {
        ValidatorData {
            index,
            balance: 32_000_000_000,
            status,
            validator: Validator {
                pubkey,
                withdrawal_credentials: Hash256::ZERO,
                effective_balance: 32_000_000_000,
                slashed: status.is_slashed(),
                activation_eligibility_epoch: Epoch::new(0),
                activation_epoch: Epoch::new(0),
                exit_epoch: Epoch::max_value(),
                withdrawable_epoch: Epoch::max_value(),
            },
        }
    }

    #[test]
    fn indices_are_never_rebound() {
        let registry = ValidatorRegistry::new(vec![pubkey(1)]);
        let outcome = registry.apply_chain_view(vec![chain_data(
            pubkey(1),
            42,
            ValidatorStatus::ActiveOngoing,
        )]);
        assert_eq!(outcome.new_indices, 1);
        assert_eq!(registry.index_of(&pubkey(1)), Some(42));

        let outcome = registry.apply_chain_view(vec![chain_data(
            pubkey(1),
            43,
            ValidatorStatus::ActiveOngoing,
        )]);
        assert_eq!(outcome.new_indices, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            registry.index_of(&pubkey(1)),
            Some(42),
            "existing binding must be kept"
        );
    }

    #[test]
    fn refresh_is_idempotent() {
        let registry = ValidatorRegistry::new(vec![pubkey(1), pubkey(2)]);
        let data = vec![
            chain_data(pubkey(1), 10, ValidatorStatus::ActiveOngoing),
            chain_data(pubkey(2), 11, ValidatorStatus::PendingQueued),
        ];
        registry.apply_chain_view(data.clone());
        let before = registry.snapshot();
        registry.apply_chain_view(data);
        let mut after = registry.snapshot();
        let mut before = before;
        before.sort_by_key(|r| r.pubkey);
        after.sort_by_key(|r| r.pubkey);
        assert_eq!(before, after);
    }

    #[test]
    fn newly_slashed_keys_are_reported_once() {
        let registry = ValidatorRegistry::new(vec![pubkey(1)]);
        registry.apply_chain_view(vec![chain_data(
            pubkey(1),
            7,
            ValidatorStatus::ActiveOngoing,
        )]);
        let outcome = registry.apply_chain_view(vec![chain_data(
            pubkey(1),
            7,
            ValidatorStatus::ActiveSlashed,
        )]);
        assert_eq!(outcome.slashed, vec![pubkey(1)]);
        let outcome = registry.apply_chain_view(vec![chain_data(
            pubkey(1),
            7,
            ValidatorStatus::ActiveSlashed,
        )]);
        assert!(outcome.slashed.is_empty(), "already-known slashings are not re-reported");
    }

    #[test]
    fn keymanager_mutations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ValidatorRegistry::from_remote_keys_file(dir.path()).unwrap();
        assert_eq!(registry.num_validators(), 0);

        let results = registry
            .add_remote_keys(vec![
                RemoteKeyEntry {
                    pubkey: pubkey(1),
                    url: None,
                },
                RemoteKeyEntry {
                    pubkey: pubkey(2),
                    url: None,
                },
            ])
            .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(registry
            .record(&pubkey(1))
            .unwrap()
            .added_at_runtime);

        registry
            .set_gas_limit(&pubkey(1), Some(36_000_000))
            .unwrap();
        assert_eq!(
            registry.record(&pubkey(1)).unwrap().gas_limit,
            Some(36_000_000)
        );

        // A fresh registry from the same directory sees the persisted keys.
        let reloaded = ValidatorRegistry::from_remote_keys_file(dir.path()).unwrap();
        assert_eq!(reloaded.num_validators(), 2);
        assert!(
            !reloaded.record(&pubkey(1)).unwrap().added_at_runtime,
            "persisted keys re-run the doppelganger guard on next startup"
        );

        registry.delete_remote_keys(&[pubkey(2)]).unwrap();
        let reloaded = ValidatorRegistry::from_remote_keys_file(dir.path()).unwrap();
        assert_eq!(reloaded.num_validators(), 1);
    }
}
