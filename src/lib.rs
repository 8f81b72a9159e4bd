//! TyWallet Core - multi-chain wallet key and transaction engine
//!
//! This library is the non-custodial core behind the TyWallet application:
//! mnemonic-based key generation, authenticated encryption of key material at
//! rest, balance lookup through public indexers, transaction construction and
//! signing for Bitcoin and Ethereum, and resilient multi-endpoint broadcast.
//! The UI shell, installer, and price-ticker service live elsewhere and talk
//! to this crate through [`engine::WalletEngine`].

pub mod error;
pub mod config;
pub mod crypto;
pub mod vault;
pub mod store;
pub mod net;
pub mod fee;
pub mod chain;
pub mod price;
pub mod engine;

// Re-export commonly used types for convenience
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
