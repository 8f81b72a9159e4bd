//! Chain adapters
//!
//! One capability interface over the per-chain implementations: address
//! derivation, balance lookup, receiving-address reconciliation, transaction
//! construction, signing, and broadcast. Callers hold a `dyn ChainAdapter`
//! and never branch on the chain themselves.

use async_trait::async_trait;

use crate::crypto::keys::{Chain, KeyPair, PrivateKey, PublicKey};
use crate::error::Result;
use crate::fee::{FeeQuote, FeeTier};

pub mod bitcoin;
pub mod ethereum;

/// Confirmed and pending balance in the chain's smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Balance {
    pub confirmed: u128,
    pub pending: u128,
}

impl Balance {
    /// Balance spendable right now.
    pub fn spendable(&self) -> u128 {
        self.confirmed
    }
}

/// Send the stated amount, or sweep everything spendable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Send,
    Sweep,
}

/// An in-memory spend request. Never persisted.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub chain: Chain,
    /// Funding address. The engine overwrites this with the reconciled
    /// active address before building.
    pub from: String,
    pub to: String,
    /// Amount in the chain's smallest unit. Ignored for sweeps.
    pub amount: u128,
    pub fee_tier: FeeTier,
    pub mode: SendMode,
}

/// A built-but-unsigned transaction with its fee accounting.
#[derive(Debug, Clone)]
pub enum UnsignedTransaction {
    Bitcoin(bitcoin::UnsignedBitcoinTx),
    Ethereum(ethereum::UnsignedEthereumTx),
}

impl UnsignedTransaction {
    /// Amount actually paid to the destination, in the smallest unit.
    pub fn amount(&self) -> u128 {
        match self {
            Self::Bitcoin(tx) => u128::from(tx.amount),
            Self::Ethereum(tx) => tx.value,
        }
    }

    /// Total fee, in the smallest unit.
    pub fn fee(&self) -> u128 {
        match self {
            Self::Bitcoin(tx) => u128::from(tx.fee),
            Self::Ethereum(tx) => tx.fee(),
        }
    }

    /// The quote the fee was computed from.
    pub fn fee_quote(&self) -> &FeeQuote {
        match self {
            Self::Bitcoin(tx) => &tx.fee_quote,
            Self::Ethereum(tx) => &tx.fee_quote,
        }
    }
}

/// The active receiving key for a wallet: the address funds should land on
/// and the key pair that controls it.
pub struct ActiveKey {
    pub address: String,
    pub key_pair: KeyPair,
}

/// Chain-specific wallet capabilities.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Chain-native address encoding of `public_key`. Pure and deterministic;
    /// the basis of the record self-consistency check.
    fn derive_address(&self, public_key: &PublicKey) -> Result<String>;

    /// Syntactic validity of a destination address.
    fn validate_address(&self, address: &str) -> Result<()>;

    /// Balance of `address` from the first indexer that answers. Results
    /// from different indexers are never blended.
    async fn get_balance(&self, address: &str) -> Result<Balance>;

    /// Resolve the receiving key that should be active for this wallet,
    /// scanning derivable sibling addresses where the chain allows funds to
    /// drift across them. The caller repoints the store if the result
    /// differs from the record.
    async fn reconcile_address(&self, seed: &[u8]) -> Result<ActiveKey>;

    /// Construct an unsigned transaction for `request` priced by `quote`.
    /// Fetches chain state (UTXO set or nonce) fresh; nothing is cached
    /// between builds.
    async fn build_transaction(
        &self,
        request: &TransactionRequest,
        quote: FeeQuote,
    ) -> Result<UnsignedTransaction>;

    /// Deterministic ECDSA signing over the chain's canonical digest.
    /// Implementations must never log or echo key material.
    fn sign_transaction(&self, tx: &UnsignedTransaction, private_key: &PrivateKey) -> Result<Vec<u8>>;

    /// Ordered-fallback broadcast; returns the format-validated transaction
    /// id from the first endpoint that accepts.
    async fn broadcast_transaction(&self, signed: &[u8]) -> Result<String>;
}
