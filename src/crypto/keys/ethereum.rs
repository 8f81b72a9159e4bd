//! Ethereum key derivation and address encoding

use secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1};

use crate::error::{Error, Result};
use super::derivation::{derive_secret_key, Chain, KeyPair, PrivateKey, PublicKey};

/// Derive an Ethereum key pair from a seed and derivation path
pub fn derive_ethereum_key_pair(seed: &[u8], path: &str) -> Result<KeyPair> {
    let secret_key = derive_secret_key(seed, path)?;

    let secp = Secp256k1::new();
    let public_key = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);

    let private_key = PrivateKey::new(secret_key.secret_bytes().to_vec(), Chain::Ethereum);
    let public_key = PublicKey::new(public_key.serialize_uncompressed().to_vec(), Chain::Ethereum);

    KeyPair::new(private_key, public_key)
}

/// Get the Ethereum address from a public key
pub fn public_key_to_address(public_key: &PublicKey) -> Result<String> {
    if public_key.chain() != Chain::Ethereum {
        return Err(Error::KeyDerivation("Not an Ethereum public key".to_string()));
    }

    let public_key = public_key.as_bytes();

    // The public key should be in uncompressed format (65 bytes)
    if public_key.len() != 65 {
        return Err(Error::KeyDerivation("Invalid Ethereum public key length".to_string()));
    }

    // Skip the first byte (0x04) and hash the rest
    let key_hash = keccak256(&public_key[1..]);

    // Take the last 20 bytes of the hash
    let address = &key_hash[12..];

    // Format as a hex string with 0x prefix
    Ok(format!("0x{}", hex::encode(address)))
}

/// Calculate the Keccak-256 hash of data
pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}
