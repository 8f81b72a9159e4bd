//! Wallet engine
//!
//! The orchestration layer the embedding application talks to. Owns the
//! store, the shared network client, the vault, and one adapter per chain.
//! Balance and price lookups on different chains may run concurrently, but
//! everything touching a single chain's wallet record — reconcile, build,
//! sign, broadcast — executes as one serialized sequence so a spend can
//! never race another spend into a stale nonce or UTXO snapshot.

use std::str;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::chain::bitcoin::BitcoinAdapter;
use crate::chain::ethereum::EthereumAdapter;
use crate::chain::{ActiveKey, Balance, ChainAdapter, SendMode, TransactionRequest};
use crate::config::WalletConfig;
use crate::crypto::keys::Chain;
use crate::crypto::mnemonic::mnemonic_to_seed;
use crate::error::{Error, Result};
use crate::fee::FeeEstimator;
use crate::net::NetworkClient;
use crate::price::PriceClient;
use crate::store::WalletStore;
use crate::vault::{KeyVault, WalletMaterial};

/// Phases of a spend, in order. Transitions are one-directional; a failure
/// before `Broadcasting` leaves no network side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPhase {
    Idle,
    Reconciling,
    FeeQuoting,
    Building,
    Signing,
    Broadcasting,
    ConfirmedPending,
    Failed,
}

impl std::fmt::Display for SpendPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Reconciling => "reconciling",
            Self::FeeQuoting => "fee-quoting",
            Self::Building => "building",
            Self::Signing => "signing",
            Self::Broadcasting => "broadcasting",
            Self::ConfirmedPending => "confirmed-pending",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful spend.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub chain: Chain,
    pub txid: String,
    /// Amount delivered to the destination, smallest unit.
    pub amount: u128,
    /// Fee paid, smallest unit.
    pub fee: u128,
}

struct SpendLocks {
    bitcoin: Mutex<()>,
    ethereum: Mutex<()>,
}

impl SpendLocks {
    fn for_chain(&self, chain: Chain) -> &Mutex<()> {
        match chain {
            Chain::Bitcoin => &self.bitcoin,
            Chain::Ethereum => &self.ethereum,
        }
    }
}

/// Top-level wallet API.
pub struct WalletEngine {
    store: WalletStore,
    vault: KeyVault,
    fees: Arc<FeeEstimator>,
    bitcoin: BitcoinAdapter,
    ethereum: EthereumAdapter,
    prices: PriceClient,
    spend_locks: SpendLocks,
}

impl WalletEngine {
    pub fn new(config: WalletConfig) -> Result<Self> {
        let client = Arc::new(NetworkClient::new(config.read_timeout, config.broadcast_timeout)?);
        let fees = Arc::new(FeeEstimator::new(
            client.clone(),
            config.bitcoin.fee_oracles.clone(),
            config.ethereum.rpc.clone(),
        ));
        let bitcoin = BitcoinAdapter::new(config.network, config.bitcoin.clone(), client.clone());
        let ethereum = EthereumAdapter::new(config.ethereum.clone(), client.clone());
        let prices = PriceClient::new(client, config.price.clone());

        Ok(Self {
            store: WalletStore::open(&config.store_path),
            vault: KeyVault::new(config.network),
            fees,
            bitcoin,
            ethereum,
            prices,
            spend_locks: SpendLocks {
                bitcoin: Mutex::new(()),
                ethereum: Mutex::new(()),
            },
        })
    }

    pub fn store(&self) -> &WalletStore {
        &self.store
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn adapter(&self, chain: Chain) -> &dyn ChainAdapter {
        match chain {
            Chain::Bitcoin => &self.bitcoin,
            Chain::Ethereum => &self.ethereum,
        }
    }

    /// Create the wallet for `chain`, encrypt its secrets under
    /// `master_key`, and persist the record. Fails if a wallet already
    /// exists: wallets are created once and removed only by
    /// [`wipe_wallet`](Self::wipe_wallet). The returned material is the one
    /// chance to show the user their mnemonic.
    pub fn create_wallet(&self, chain: Chain, master_key: &str) -> Result<WalletMaterial> {
        let snapshot = self.store.read()?;
        if snapshot.has_wallet(chain) {
            return Err(Error::InvalidInput(format!(
                "a {} wallet already exists; wipe it before creating a new one",
                chain
            )));
        }

        let material = self.vault.generate(chain)?;
        self.vault
            .verify_material(chain, &material.private_key, &material.address)?;

        let key_secret = self.vault.encrypt(&material.private_key, master_key)?;
        let mnemonic_secret = self.vault.encrypt(material.mnemonic.as_bytes(), master_key)?;
        self.store.write(|s| {
            s.set_wallet(chain, &material.address, key_secret, mnemonic_secret);
        })?;

        info!(chain = %chain, address = %material.address, "wallet created");
        Ok(material)
    }

    /// Remove the wallet record for `chain`. The only deletion path.
    pub fn wipe_wallet(&self, chain: Chain) -> Result<()> {
        self.store.write(|s| s.clear_wallet(chain))?;
        info!(chain = %chain, "wallet wiped");
        Ok(())
    }

    /// Balance of the active address, repairing address drift first.
    pub async fn check_balance(&self, chain: Chain, master_key: &str) -> Result<Balance> {
        let active = self.reconcile(chain, master_key).await?;
        self.adapter(chain).get_balance(&active.address).await
    }

    /// Current fiat price of the chain's coin. Display data only.
    pub async fn price(&self, chain: Chain) -> Result<f64> {
        self.prices.price(chain).await
    }

    /// Execute a spend end to end: reconcile, quote, build, sign,
    /// broadcast. Serialized per chain; see the module docs.
    pub async fn send(&self, request: TransactionRequest, master_key: &str) -> Result<SendReceipt> {
        let chain = request.chain;
        let _guard = self.spend_locks.for_chain(chain).lock().await;

        let outcome = self.run_spend(request, master_key).await;
        match &outcome {
            Ok(receipt) => {
                info!(chain = %chain, txid = %receipt.txid, phase = %SpendPhase::ConfirmedPending, "spend complete");
            }
            Err(Error::BroadcastAmbiguous(reason)) => {
                // Not a clean failure: the network may already have the
                // transaction. The caller must resolve before re-sending.
                warn!(chain = %chain, reason = %reason, "spend outcome ambiguous");
            }
            Err(e) => {
                warn!(chain = %chain, phase = %SpendPhase::Failed, error = %e, "spend failed");
            }
        }
        outcome
    }

    async fn run_spend(&self, mut request: TransactionRequest, master_key: &str) -> Result<SendReceipt> {
        let chain = request.chain;
        let adapter = self.adapter(chain);

        if request.mode == SendMode::Send && request.amount == 0 {
            return Err(Error::InvalidInput("amount must be greater than zero".to_string()));
        }
        adapter.validate_address(&request.to)?;

        info!(chain = %chain, phase = %SpendPhase::Reconciling, "spend phase");
        let active = self.reconcile(chain, master_key).await?;
        self.vault
            .verify_material(chain, active.key_pair.private_key().as_bytes(), &active.address)?;
        request.from = active.address.clone();

        info!(chain = %chain, phase = %SpendPhase::FeeQuoting, tier = %request.fee_tier, "spend phase");
        let quote = self.fees.quote(chain, request.fee_tier).await;

        info!(chain = %chain, phase = %SpendPhase::Building, "spend phase");
        let unsigned = adapter.build_transaction(&request, quote).await?;

        info!(chain = %chain, phase = %SpendPhase::Signing, "spend phase");
        let signed = adapter.sign_transaction(&unsigned, active.key_pair.private_key())?;

        info!(chain = %chain, phase = %SpendPhase::Broadcasting, "spend phase");
        let txid = adapter.broadcast_transaction(&signed).await?;

        Ok(SendReceipt {
            chain,
            txid,
            amount: unsigned.amount(),
            fee: unsigned.fee(),
        })
    }

    /// Decrypt the wallet's mnemonic, resolve the receiving key that should
    /// be active, and repair the record if it drifted. Runs before every
    /// balance check and every spend.
    async fn reconcile(&self, chain: Chain, master_key: &str) -> Result<ActiveKey> {
        let snapshot = self.store.read()?;
        let secret = snapshot
            .encrypted_mnemonic(chain)
            .ok_or_else(|| Error::InvalidInput(format!("no {} wallet on record", chain)))?;

        let mnemonic = self.vault.decrypt(secret, master_key)?;
        let phrase = str::from_utf8(&mnemonic)
            .map_err(|_| Error::Decryption("stored mnemonic is not valid UTF-8".to_string()))?;
        let seed = Zeroizing::new(mnemonic_to_seed(phrase, None)?);

        let active = self.adapter(chain).reconcile_address(&seed).await?;

        if snapshot.address(chain) != Some(active.address.as_str()) {
            warn!(chain = %chain, address = %active.address, "receiving-address drift repaired");
            let key_secret = self
                .vault
                .encrypt(active.key_pair.private_key().as_bytes(), master_key)?;
            self.store.write(|s| {
                s.set_address(chain, &active.address);
                s.set_encrypted_private_key(chain, key_secret);
            })?;
        }

        Ok(active)
    }
}
