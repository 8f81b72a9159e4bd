//! Wallet store
//!
//! The persisted wallet document: which chains have a wallet, the active
//! address per chain, the encrypted key material, and the general settings
//! owned by the settings collaborator. The file is the durability boundary:
//! every read reparses it and every write atomically replaces it, trading
//! performance for freshness since balances change underneath the process.
//!
//! Writers serialize behind an in-process lock. Running two application
//! instances against one store file is not supported.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::crypto::keys::Chain;
use crate::error::{Error, Result};
use crate::vault::EncryptedSecret;

/// General settings written by the settings collaborator; the core only
/// round-trips them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "FaveCoin", default)]
    pub fave_coin: String,
    /// Historically `false` when unset, a string otherwise.
    #[serde(
        rename = "PriceApiKey",
        default,
        deserialize_with = "string_or_false",
        serialize_with = "none_as_false"
    )]
    pub price_api_key: Option<String>,
}

fn string_or_false<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Bool(false) | serde_json::Value::Null => Ok(None),
        other => Err(serde::de::Error::custom(format!(
            "expected string or false, got {}",
            other
        ))),
    }
}

fn none_as_false<S>(value: &Option<String>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_bool(false),
    }
}

/// Snapshot of the persisted document.
///
/// Maps are keyed by chain name so the file stays readable and stable for
/// the settings collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSnapshot {
    /// Which chains have a wallet.
    pub coins: BTreeMap<String, bool>,
    /// Active receiving address per chain.
    pub addresses: BTreeMap<String, String>,
    /// AEAD-protected private key per chain.
    pub encrypted_private_keys: BTreeMap<String, EncryptedSecret>,
    /// AEAD-protected mnemonic per chain.
    pub encrypted_mnemonics: BTreeMap<String, EncryptedSecret>,
    pub general: GeneralSettings,
}

impl StoreSnapshot {
    pub fn has_wallet(&self, chain: Chain) -> bool {
        self.coins.get(chain.name()).copied().unwrap_or(false)
    }

    pub fn address(&self, chain: Chain) -> Option<&str> {
        self.addresses.get(chain.name()).map(String::as_str)
    }

    pub fn encrypted_private_key(&self, chain: Chain) -> Option<&EncryptedSecret> {
        self.encrypted_private_keys.get(chain.name())
    }

    pub fn encrypted_mnemonic(&self, chain: Chain) -> Option<&EncryptedSecret> {
        self.encrypted_mnemonics.get(chain.name())
    }

    /// Record a freshly created wallet.
    pub fn set_wallet(
        &mut self,
        chain: Chain,
        address: &str,
        private_key: EncryptedSecret,
        mnemonic: EncryptedSecret,
    ) {
        self.coins.insert(chain.name().to_string(), true);
        self.addresses.insert(chain.name().to_string(), address.to_string());
        self.encrypted_private_keys.insert(chain.name().to_string(), private_key);
        self.encrypted_mnemonics.insert(chain.name().to_string(), mnemonic);
    }

    /// Repoint the active address (reconciliation only).
    pub fn set_address(&mut self, chain: Chain, address: &str) {
        self.addresses.insert(chain.name().to_string(), address.to_string());
    }

    /// Replace the encrypted private key (reconciliation only).
    pub fn set_encrypted_private_key(&mut self, chain: Chain, secret: EncryptedSecret) {
        self.encrypted_private_keys.insert(chain.name().to_string(), secret);
    }

    /// Remove every trace of the chain's wallet.
    pub fn clear_wallet(&mut self, chain: Chain) {
        self.coins.insert(chain.name().to_string(), false);
        self.addresses.remove(chain.name());
        self.encrypted_private_keys.remove(chain.name());
        self.encrypted_mnemonics.remove(chain.name());
    }
}

/// The persisted wallet document and its read-modify-write contract.
pub struct WalletStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WalletStore {
    /// Open a store at `path`. The file is created on first write; a missing
    /// file reads as an empty snapshot (fresh install).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current snapshot from disk. Never cached.
    pub fn read(&self) -> Result<StoreSnapshot> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::default());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| Error::ConfigCorrupt(format!("unreadable store file: {}", e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigCorrupt(format!("malformed store file: {}", e)))
    }

    /// Apply `mutator` to the current snapshot and persist the result.
    ///
    /// The whole read-modify-write runs under the store lock, so concurrent
    /// writers in this process cannot interleave and lose updates.
    pub fn write<F>(&self, mutator: F) -> Result<StoreSnapshot>
    where
        F: FnOnce(&mut StoreSnapshot),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut snapshot = self.read()?;
        mutator(&mut snapshot);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write-then-rename so a crash mid-write cannot corrupt the store.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "store persisted");
        Ok(())
    }
}
