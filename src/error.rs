//! Error types for the wallet core

use thiserror::Error;

/// One recorded failure while walking an ordered endpoint fallback list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    /// Endpoint name as configured.
    pub endpoint: String,
    /// What went wrong at that endpoint.
    pub reason: String,
}

impl std::fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.reason)
    }
}

fn format_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Custom error type for wallet-core operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Entropy error: {0}")]
    Entropy(String),

    #[error("Mnemonic error: {0}")]
    Mnemonic(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A send would exceed the spendable balance. Amounts are in the
    /// chain's smallest unit; `max_sendable` is floored at zero so callers
    /// can render it directly.
    #[error("Insufficient funds: available {available}, required {required} (fee {fee}), maximum sendable {max_sendable}")]
    InsufficientFunds {
        available: u128,
        required: u128,
        fee: u128,
        max_sendable: u128,
    },

    /// The balance does not even cover the fee; nothing can be spent.
    #[error("Balance too small to spend: available {available}, fee {fee}")]
    DustAmount { available: u128, fee: u128 },

    #[error("All endpoints failed: {}", format_failures(.failures))]
    AllEndpointsFailed { failures: Vec<EndpointFailure> },

    /// Bytes were handed to an endpoint but no definitive answer came back.
    /// The transaction may have been accepted; callers must not re-send.
    #[error("Broadcast outcome unknown: {0}")]
    BroadcastAmbiguous(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Wallet store corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("Balance unavailable: {0}")]
    BalanceUnavailable(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Last failure recorded in an [`Error::AllEndpointsFailed`], if any.
    pub fn last_endpoint_failure(&self) -> Option<&EndpointFailure> {
        match self {
            Self::AllEndpointsFailed { failures } => failures.last(),
            _ => None,
        }
    }
}

/// Result type for wallet-core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_endpoints_failed_enumerates_every_failure() {
        let error = Error::AllEndpointsFailed {
            failures: vec![
                EndpointFailure {
                    endpoint: "Blockstream".to_string(),
                    reason: "HTTP 500".to_string(),
                },
                EndpointFailure {
                    endpoint: "Mempool.space".to_string(),
                    reason: "timed out".to_string(),
                },
            ],
        };

        let rendered = error.to_string();
        assert!(rendered.contains("Blockstream: HTTP 500"));
        assert!(rendered.contains("Mempool.space: timed out"));
        assert_eq!(error.last_endpoint_failure().unwrap().endpoint, "Mempool.space");
    }

    #[test]
    fn insufficient_funds_carries_numeric_detail() {
        let error = Error::InsufficientFunds {
            available: 100_000,
            required: 105_000,
            fee: 25_000,
            max_sendable: 75_000,
        };
        let rendered = error.to_string();
        assert!(rendered.contains("100000"));
        assert!(rendered.contains("75000"));
    }
}
