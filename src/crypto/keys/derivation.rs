//! Common key derivation functionality
//!
//! The BIP-32 arithmetic is identical for every secp256k1 chain; only the
//! derivation path and the address encoding differ. The per-chain modules
//! supply those two pieces and share everything here.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Chain {
    /// Bitcoin
    Bitcoin,
    /// Ethereum
    Ethereum,
}

impl Chain {
    /// Chain name as used for store keys and display.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bitcoin => "Bitcoin",
            Self::Ethereum => "Ethereum",
        }
    }

    /// Coin identifier used by the price service.
    pub fn coin_id(&self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::Ethereum => "ethereum",
        }
    }

    /// Canonical receiving-key derivation path: index 0 of the first
    /// external account, so every wallet has exactly one receiving address.
    pub fn derivation_path(&self) -> &'static str {
        match self {
            Self::Bitcoin => "m/84'/0'/0'/0/0",
            Self::Ethereum => "m/44'/60'/0'/0/0",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Bitcoin" => Ok(Self::Bitcoin),
            "Ethereum" => Ok(Self::Ethereum),
            other => Err(Error::InvalidInput(format!("unknown chain: {}", other))),
        }
    }
}

/// A private key for a specific blockchain. Zeroizes its bytes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    /// The raw private key bytes
    bytes: Vec<u8>,
    /// The chain this key belongs to
    #[zeroize(skip)]
    chain: Chain,
}

impl PrivateKey {
    /// Create a new private key from bytes
    pub fn new(bytes: Vec<u8>, chain: Chain) -> Self {
        Self { bytes, chain }
    }

    /// Get the raw private key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the chain
    pub fn chain(&self) -> Chain {
        self.chain
    }
}

// Key bytes must never appear in logs or panic messages.
impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("chain", &self.chain)
            .field("bytes", &"[redacted]")
            .finish()
    }
}

/// A public key for a specific blockchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// The raw public key bytes
    bytes: Vec<u8>,
    /// The chain this key belongs to
    chain: Chain,
}

impl PublicKey {
    /// Create a new public key from bytes
    pub fn new(bytes: Vec<u8>, chain: Chain) -> Self {
        Self { bytes, chain }
    }

    /// Get the raw public key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the chain
    pub fn chain(&self) -> Chain {
        self.chain
    }
}

/// A key pair for a specific blockchain
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// The private key
    private_key: PrivateKey,
    /// The public key
    public_key: PublicKey,
}

impl KeyPair {
    /// Create a new key pair
    pub fn new(private_key: PrivateKey, public_key: PublicKey) -> Result<Self> {
        if private_key.chain() != public_key.chain() {
            return Err(Error::KeyDerivation("Chain mismatch".to_string()));
        }
        Ok(Self { private_key, public_key })
    }

    /// Get the private key
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the chain
    pub fn chain(&self) -> Chain {
        self.private_key.chain()
    }
}

/// Derive a key pair from a seed for a specific blockchain
pub fn derive_key_pair(seed: &[u8], chain: Chain, path: &str) -> Result<KeyPair> {
    match chain {
        Chain::Bitcoin => super::bitcoin::derive_bitcoin_key_pair(seed, path),
        Chain::Ethereum => super::ethereum::derive_ethereum_key_pair(seed, path),
    }
}

/// Derive the secp256k1 secret key at `path` from a BIP39 seed.
pub(crate) fn derive_secret_key(seed: &[u8], path: &str) -> Result<SecretKey> {
    let path_components = parse_derivation_path(path)?;

    let (mut secret_key, mut chain_code) = derive_master_key(seed)?;

    for component in path_components {
        (secret_key, chain_code) = derive_child_key(secret_key, chain_code, component)?;
    }

    SecretKey::from_slice(&secret_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid secret key: {}", e)))
}

/// Parse a BIP-32 derivation path
fn parse_derivation_path(path: &str) -> Result<Vec<u32>> {
    if !path.starts_with("m/") {
        return Err(Error::KeyDerivation(format!("Invalid derivation path: {}", path)));
    }

    let components = path.trim_start_matches("m/").split('/');
    let mut result = Vec::new();

    for component in components {
        if component.is_empty() {
            continue;
        }

        let hardened = component.ends_with('\'');
        let index = if hardened {
            let index = component.trim_end_matches('\'').parse::<u32>()
                .map_err(|_| Error::KeyDerivation(format!("Invalid derivation path component: {}", component)))?;
            0x80000000 + index
        } else {
            component.parse::<u32>()
                .map_err(|_| Error::KeyDerivation(format!("Invalid derivation path component: {}", component)))?
        };

        result.push(index);
    }

    Ok(result)
}

/// Derive the master key from a seed
fn derive_master_key(seed: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
        .map_err(|_| Error::KeyDerivation("HMAC error".to_string()))?;

    hmac.update(seed);
    let result = hmac.finalize().into_bytes();

    let mut secret_key = [0u8; 32];
    let mut chain_code = [0u8; 32];

    secret_key.copy_from_slice(&result[0..32]);
    chain_code.copy_from_slice(&result[32..64]);

    Ok((secret_key, chain_code))
}

/// Derive a child key from a parent key
fn derive_child_key(parent_key: [u8; 32], parent_chain_code: [u8; 32], index: u32) -> Result<([u8; 32], [u8; 32])> {
    let secp = Secp256k1::new();
    let parent_secret_key = SecretKey::from_slice(&parent_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid parent key: {}", e)))?;

    let mut data = Vec::with_capacity(37);

    if index >= 0x80000000 {
        // Hardened derivation
        data.push(0);
        data.extend_from_slice(&parent_key);
    } else {
        // Normal derivation
        let parent_public_key = Secp256k1PublicKey::from_secret_key(&secp, &parent_secret_key);
        data.extend_from_slice(&parent_public_key.serialize());
    }

    // Append the index
    data.extend_from_slice(&index.to_be_bytes());

    // Calculate HMAC-SHA512
    let mut hmac = Hmac::<Sha512>::new_from_slice(&parent_chain_code)
        .map_err(|_| Error::KeyDerivation("HMAC error".to_string()))?;

    hmac.update(&data);
    let result = hmac.finalize().into_bytes();

    let mut child_key = [0u8; 32];
    let mut child_chain_code = [0u8; 32];

    child_key.copy_from_slice(&result[0..32]);
    child_chain_code.copy_from_slice(&result[32..64]);

    // Add the parent key to the child key (mod n)
    let child_secret_key = SecretKey::from_slice(&child_key)
        .map_err(|e| Error::KeyDerivation(format!("Invalid child key: {}", e)))?;

    let child_secret_key = child_secret_key.add_tweak(&parent_secret_key.into())
        .map_err(|e| Error::KeyDerivation(format!("Key addition error: {}", e)))?;

    Ok((child_secret_key.secret_bytes(), child_chain_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mnemonic::mnemonic_to_seed;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_path_must_start_with_m() {
        assert!(parse_derivation_path("44'/0'/0'").is_err());
        assert!(parse_derivation_path("m/44'/0'/0'").is_ok());
    }

    #[test]
    fn test_path_rejects_garbage_components() {
        assert!(parse_derivation_path("m/44'/x/0").is_err());
    }

    #[test]
    fn test_hardened_components_are_offset() {
        let components = parse_derivation_path("m/84'/0'/0'/0/1").unwrap();
        assert_eq!(components, vec![0x80000000 + 84, 0x80000000, 0x80000000, 0, 1]);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();
        let first = derive_secret_key(&seed, "m/84'/0'/0'/0/0").unwrap();
        let second = derive_secret_key(&seed, "m/84'/0'/0'/0/0").unwrap();
        assert_eq!(first.secret_bytes(), second.secret_bytes());
    }

    #[test]
    fn test_sibling_indexes_differ() {
        let seed = mnemonic_to_seed(MNEMONIC, None).unwrap();
        let first = derive_secret_key(&seed, "m/84'/0'/0'/0/0").unwrap();
        let second = derive_secret_key(&seed, "m/84'/0'/0'/0/1").unwrap();
        assert_ne!(first.secret_bytes(), second.secret_bytes());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::new(vec![7u8; 32], Chain::Bitcoin);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains('7'));
    }
}
