//! Runtime configuration
//!
//! Everything the components need from the embedding application arrives in
//! an explicit [`WalletConfig`] handed to constructors. There is no
//! process-wide state; two engines with different configs can coexist in one
//! process (though they must not share a store file).

use std::path::PathBuf;
use std::time::Duration;

use bitcoin::Network;

use crate::net::Endpoint;

/// Bitcoin-side endpoint lists, each in preference order.
#[derive(Debug, Clone)]
pub struct BitcoinEndpoints {
    /// Esplora-compatible address/UTXO indexers (base URLs).
    pub explorers: Vec<Endpoint>,
    /// Raw-transaction broadcast endpoints (full URLs, `POST` hex body).
    pub broadcast: Vec<Endpoint>,
    /// Fee oracle endpoints (full URLs).
    pub fee_oracles: Vec<Endpoint>,
}

/// Ethereum-side endpoint lists.
#[derive(Debug, Clone)]
pub struct EthereumEndpoints {
    /// JSON-RPC endpoints, in preference order. Used for balance, nonce,
    /// gas price, and broadcast.
    pub rpc: Vec<Endpoint>,
}

/// Configuration/context object passed to every component constructor.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Path of the persisted wallet store document.
    pub store_path: PathBuf,
    /// Bitcoin network. Mainnet unless testing.
    pub network: Network,
    pub bitcoin: BitcoinEndpoints,
    pub ethereum: EthereumEndpoints,
    /// Price service base URLs.
    pub price: Vec<Endpoint>,
    /// Per-call timeout for read-class operations (balance, UTXO, fee).
    pub read_timeout: Duration,
    /// Per-call timeout for broadcast-class operations.
    pub broadcast_timeout: Duration,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            store_path: home.join("TyWallet").join("config.json"),
            network: Network::Bitcoin,
            bitcoin: BitcoinEndpoints {
                explorers: vec![
                    Endpoint::new("Blockstream", "https://blockstream.info/api"),
                    Endpoint::new("Mempool.space", "https://mempool.space/api"),
                ],
                // Mempool.space first: it has accepted transactions most
                // reliably for this wallet's users.
                broadcast: vec![
                    Endpoint::new("Mempool.space", "https://mempool.space/api/tx"),
                    Endpoint::new("Blockstream", "https://blockstream.info/api/tx"),
                ],
                fee_oracles: vec![
                    Endpoint::new("Mempool.space", "https://mempool.space/api/v1/fees/recommended"),
                    Endpoint::new("Blockstream", "https://blockstream.info/api/fee-estimates"),
                ],
            },
            ethereum: EthereumEndpoints {
                rpc: vec![
                    Endpoint::new("PublicNode", "https://ethereum.publicnode.com"),
                    Endpoint::new("dRPC", "https://eth.drpc.org"),
                    Endpoint::new("Cloudflare", "https://cloudflare-eth.com"),
                    Endpoint::new("Ankr", "https://rpc.ankr.com/eth"),
                ],
            },
            price: vec![Endpoint::new("TyWallet", "https://api.tywallet.xyz")],
            read_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(30),
        }
    }
}
